use std::fmt;

use chrono::{Datelike, Local, Weekday};
use fantoccini::Locator;
use tokio::time::{Duration, sleep};

use crate::api::ApiError;
use crate::config::BotConfig;
use crate::session::{ApiSession, BrowserSession};
use crate::types::{BalanceSnapshot, WalletError, WithdrawalRequest, WithdrawalStatus};

/// Amounts the withdrawal form accepts. Anything else is refused before a
/// request is ever submitted.
pub const ALLOWED_WITHDRAW_AMOUNTS: &[f64] = &[60.0, 250.0, 750.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Weekend,
    InsufficientBalance,
    AlreadyWithdrawnToday,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Weekend => write!(f, "withdrawals are not processed on weekends"),
            SkipReason::InsufficientBalance => write!(f, "insufficient balance"),
            SkipReason::AlreadyWithdrawnToday => write!(f, "a withdrawal was already made today"),
        }
    }
}

/// Final word from the checker stage, carried into the proof artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum WithdrawalOutcome {
    Confirmed { amount: f64 },
    Rejected { reason: String },
    TimedOut,
    Skipped(SkipReason),
}

impl WithdrawalOutcome {
    pub fn summary(&self) -> String {
        match self {
            WithdrawalOutcome::Confirmed { amount } => {
                format!("withdrawal of {amount} submitted and pending review")
            }
            WithdrawalOutcome::Rejected { reason } => format!("withdrawal rejected: {reason}"),
            WithdrawalOutcome::TimedOut => "withdrawal not confirmed in time".to_string(),
            WithdrawalOutcome::Skipped(reason) => format!("no withdrawal: {reason}"),
        }
    }
}

pub fn amount_allowed(amount: f64) -> bool {
    ALLOWED_WITHDRAW_AMOUNTS.contains(&amount)
}

pub fn is_restricted_day(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

/// The submission rule: a withdrawal goes out iff the balance covers the
/// threshold and today is a weekday.
pub fn withdrawal_decision(balance: f64, threshold: f64, day: Weekday) -> Result<(), SkipReason> {
    if is_restricted_day(day) {
        return Err(SkipReason::Weekend);
    }
    if balance < threshold {
        return Err(SkipReason::InsufficientBalance);
    }
    Ok(())
}

/// Maps a record's status text to a final state, or `None` while the site
/// is still making up its mind.
pub fn classify_status(text: &str) -> Option<WithdrawalStatus> {
    let lowered = text.to_lowercase();
    if ["pending", "review", "approved", "success"]
        .iter()
        .any(|m| lowered.contains(m))
    {
        return Some(WithdrawalStatus::Confirmed);
    }
    if ["reject", "fail", "denied"].iter().any(|m| lowered.contains(m)) {
        return Some(WithdrawalStatus::Rejected(text.to_string()));
    }
    None
}

/// Renders an amount the way the site's grid buttons label it.
fn format_amount(amount: f64) -> String {
    if amount.fract() == 0.0 {
        format!("{}", amount as i64)
    } else {
        format!("{amount}")
    }
}

fn today_record_date() -> String {
    Local::now().format("%d-%m-%Y").to_string()
}

const CONFIRM_POLL_SECS: u64 = 5;

//
// ---------- Browser path ----------
//

const BALANCE_TEXT: Locator<'static> =
    Locator::XPath("//p[text()='Personal Balance(PHP)']/following-sibling::p");
const RECORDS_TAB: Locator<'static> =
    Locator::XPath("//div[contains(@class, 'van-tab')]//span[text()='Withdrawal Records']");
const RECORD_ITEMS: Locator<'static> =
    Locator::XPath("//div[contains(@class, 'FundItem') and contains(@class, 'van-cell')]");

/// Reads the balance and, when the policy allows, submits exactly one
/// withdrawal and polls the record list for its confirmation.
pub async fn check_and_withdraw_browser(
    session: &mut BrowserSession,
    config: &BotConfig,
) -> Result<WithdrawalOutcome, WalletError> {
    log::info!("checking balance and withdrawal status");

    if !amount_allowed(config.withdraw_amount) {
        return Err(WalletError::AmountNotAllowed(config.withdraw_amount));
    }

    let today = Local::now().weekday();
    if is_restricted_day(today) {
        log::info!("today is {today}, skipping withdrawal");
        return Ok(WithdrawalOutcome::Skipped(SkipReason::Weekend));
    }

    let user_url = format!("{}/#/user", config.website_url);
    session.browser.navigate(&user_url).await?;
    let balance_text = session.browser.element_text(BALANCE_TEXT).await?;
    let amount: f64 = balance_text
        .parse()
        .map_err(|_| WalletError::BalanceRead(format!("unparsable balance '{balance_text}'")))?;
    let snapshot = BalanceSnapshot::now(amount);
    log::info!("personal balance: {} PHP", snapshot.amount);

    if let Err(reason) = withdrawal_decision(snapshot.amount, config.withdraw_amount, today) {
        log::info!("skipping withdrawal: {reason}");
        return Ok(WithdrawalOutcome::Skipped(reason));
    }

    if browser_withdrawal_today(session, config).await? {
        log::info!("a withdrawal already exists for today");
        return Ok(WithdrawalOutcome::Skipped(SkipReason::AlreadyWithdrawnToday));
    }

    let request = submit_browser_withdrawal(session, config).await?;
    log::info!(
        "withdrawal of {} submitted at {}",
        request.amount,
        request.submitted_at.format("%H:%M:%S")
    );

    verify_browser_withdrawal(session, config, request).await
}

/// Opens the withdrawal-records tab and reports whether an entry exists for
/// today's date.
async fn browser_withdrawal_today(
    session: &mut BrowserSession,
    config: &BotConfig,
) -> Result<bool, WalletError> {
    open_records_tab(session, config).await?;

    let today = today_record_date();
    for item in session.browser.find_all(RECORD_ITEMS).await? {
        let Ok(date_el) = item.find(Locator::XPath(".//span[contains(text(), '-')]")).await else {
            continue;
        };
        if let Ok(date_text) = date_el.text().await {
            if date_text.contains(&today) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

async fn open_records_tab(
    session: &mut BrowserSession,
    config: &BotConfig,
) -> Result<(), WalletError> {
    let wallet_url = format!("{}/#/user/wallet", config.website_url);
    session.browser.navigate(&wallet_url).await?;
    session.browser.click_locator(RECORDS_TAB).await?;
    sleep(Duration::from_secs(3)).await;
    Ok(())
}

async fn submit_browser_withdrawal(
    session: &mut BrowserSession,
    config: &BotConfig,
) -> Result<WithdrawalRequest, WalletError> {
    let withdraw_url = format!("{}/#/user/withdraw", config.website_url);
    session.browser.navigate(&withdraw_url).await?;

    let amount_label = format_amount(config.withdraw_amount);
    let amount_xpath = format!(
        "//div[contains(@class, 'van-grid-item__content') and normalize-space(text()) = '{amount_label}']"
    );
    session
        .browser
        .click_locator(Locator::XPath(&amount_xpath))
        .await
        .map_err(|e| WalletError::Submission(format!("amount button {amount_label}: {e}")))?;
    log::info!("selected withdrawal amount {amount_label}");

    let password_input = session
        .browser
        .wait_for(Locator::XPath(
            "//input[@placeholder='Please enter the fund password']",
        ))
        .await?;
    session
        .browser
        .fill(&password_input, &config.fund_password)
        .await?;

    session
        .browser
        .click_locator(Locator::XPath(
            "//button[contains(@class, 'van-button--danger') and .//span[text()='Submit']]",
        ))
        .await
        .map_err(|e| WalletError::Submission(format!("submit button: {e}")))?;

    Ok(WithdrawalRequest::submitted(config.withdraw_amount))
}

/// Polls the record list for today's entry until a final status appears or
/// the confirmation window lapses. Timeouts are reported, never retried,
/// to avoid a duplicate submission.
async fn verify_browser_withdrawal(
    session: &mut BrowserSession,
    config: &BotConfig,
    mut request: WithdrawalRequest,
) -> Result<WithdrawalOutcome, WalletError> {
    let today = today_record_date();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(config.confirm_timeout_secs);

    while tokio::time::Instant::now() < deadline {
        open_records_tab(session, config).await?;

        for item in session.browser.find_all(RECORD_ITEMS).await? {
            let Ok(date_el) = item.find(Locator::XPath(".//span[contains(text(), '-')]")).await
            else {
                continue;
            };
            let date_text = date_el.text().await.unwrap_or_default();
            if !date_text.contains(&today) {
                continue;
            }

            let Ok(status_el) = item
                .find(Locator::XPath(".//span[contains(@style, 'color: gray')]"))
                .await
            else {
                continue;
            };
            let status_text = status_el.text().await.unwrap_or_default();
            log::info!("today's withdrawal record status: '{status_text}'");

            match classify_status(&status_text) {
                Some(WithdrawalStatus::Confirmed) => {
                    request.status = WithdrawalStatus::Confirmed;
                    return Ok(WithdrawalOutcome::Confirmed {
                        amount: request.amount,
                    });
                }
                Some(WithdrawalStatus::Rejected(reason)) => {
                    request.status = WithdrawalStatus::Rejected(reason.clone());
                    return Ok(WithdrawalOutcome::Rejected { reason });
                }
                _ => {}
            }
        }

        sleep(Duration::from_secs(CONFIRM_POLL_SECS)).await;
    }

    log::warn!("withdrawal not confirmed within {}s", config.confirm_timeout_secs);
    session
        .browser
        .debug_screenshot(&config.artifact_dir, "withdrawal-verification-failed.png")
        .await;
    request.status = WithdrawalStatus::TimedOut;
    Ok(WithdrawalOutcome::TimedOut)
}

//
// ---------- API path ----------
//

/// Same policy as the browser path, over the site API. This is the route
/// the API+skip-WhatsApp combination takes, where no browser exists.
pub async fn check_and_withdraw_api(
    session: &ApiSession,
    config: &BotConfig,
) -> Result<WithdrawalOutcome, WalletError> {
    log::info!("checking balance and withdrawal status via API");

    if !amount_allowed(config.withdraw_amount) {
        return Err(WalletError::AmountNotAllowed(config.withdraw_amount));
    }

    let today = Local::now().weekday();
    if is_restricted_day(today) {
        log::info!("today is {today}, skipping withdrawal");
        return Ok(WithdrawalOutcome::Skipped(SkipReason::Weekend));
    }

    let snapshot = BalanceSnapshot::now(session.api.balance().await?);
    log::info!("personal balance: {} PHP", snapshot.amount);

    if let Err(reason) = withdrawal_decision(snapshot.amount, config.withdraw_amount, today) {
        log::info!("skipping withdrawal: {reason}");
        return Ok(WithdrawalOutcome::Skipped(reason));
    }

    let today_str = today_record_date();
    let already_today = session
        .api
        .withdrawal_records()
        .await?
        .iter()
        .any(|r| r.date.contains(&today_str));
    if already_today {
        log::info!("a withdrawal already exists for today");
        return Ok(WithdrawalOutcome::Skipped(SkipReason::AlreadyWithdrawnToday));
    }

    let mut request = WithdrawalRequest::submitted(config.withdraw_amount);
    match session
        .api
        .withdraw(config.withdraw_amount, &config.fund_password)
        .await
    {
        Ok(()) => {}
        // The API rejects bad fund passwords and off-menu amounts inline.
        Err(ApiError::Site { msg, .. }) => {
            request.status = WithdrawalStatus::Rejected(msg.clone());
            return Ok(WithdrawalOutcome::Rejected { reason: msg });
        }
        Err(e) => return Err(e.into()),
    }
    log::info!("withdrawal of {} submitted", request.amount);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(config.confirm_timeout_secs);
    while tokio::time::Instant::now() < deadline {
        for record in session.api.withdrawal_records().await? {
            if !record.date.contains(&today_str) {
                continue;
            }
            log::info!("today's withdrawal record status: '{}'", record.status);
            match classify_status(&record.status) {
                Some(WithdrawalStatus::Confirmed) => {
                    request.status = WithdrawalStatus::Confirmed;
                    return Ok(WithdrawalOutcome::Confirmed {
                        amount: request.amount,
                    });
                }
                Some(WithdrawalStatus::Rejected(reason)) => {
                    request.status = WithdrawalStatus::Rejected(reason.clone());
                    return Ok(WithdrawalOutcome::Rejected { reason });
                }
                _ => {}
            }
        }
        sleep(Duration::from_secs(CONFIRM_POLL_SECS)).await;
    }

    log::warn!("withdrawal not confirmed within {}s", config.confirm_timeout_secs);
    request.status = WithdrawalStatus::TimedOut;
    Ok(WithdrawalOutcome::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn withdrawal_requires_threshold_and_weekday() {
        assert_eq!(withdrawal_decision(300.0, 250.0, Weekday::Tue), Ok(()));
        assert_eq!(
            withdrawal_decision(100.0, 250.0, Weekday::Tue),
            Err(SkipReason::InsufficientBalance)
        );
        assert_eq!(
            withdrawal_decision(300.0, 250.0, Weekday::Sat),
            Err(SkipReason::Weekend)
        );
        assert_eq!(
            withdrawal_decision(300.0, 250.0, Weekday::Sun),
            Err(SkipReason::Weekend)
        );
        // weekend wins even when the balance would also be short
        assert_eq!(
            withdrawal_decision(10.0, 250.0, Weekday::Sun),
            Err(SkipReason::Weekend)
        );
    }

    #[test]
    fn boundary_balance_is_eligible() {
        assert_eq!(withdrawal_decision(250.0, 250.0, Weekday::Mon), Ok(()));
    }

    #[test]
    fn every_weekday_is_unrestricted() {
        for day in [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
        ] {
            assert!(!is_restricted_day(day));
        }
        assert!(is_restricted_day(Weekday::Sat));
        assert!(is_restricted_day(Weekday::Sun));
    }

    #[test]
    fn only_menu_amounts_are_allowed() {
        assert!(amount_allowed(60.0));
        assert!(amount_allowed(250.0));
        assert!(amount_allowed(750.0));
        assert!(!amount_allowed(100.0));
        assert!(!amount_allowed(0.0));
        assert!(!amount_allowed(-60.0));
    }

    #[test]
    fn status_text_classification() {
        assert_eq!(
            classify_status("Pending Review"),
            Some(WithdrawalStatus::Confirmed)
        );
        assert_eq!(classify_status("Approved"), Some(WithdrawalStatus::Confirmed));
        assert_eq!(
            classify_status("Rejected"),
            Some(WithdrawalStatus::Rejected("Rejected".to_string()))
        );
        assert_eq!(classify_status("Processing..."), None);
    }

    #[test]
    fn amounts_render_like_grid_labels() {
        assert_eq!(format_amount(60.0), "60");
        assert_eq!(format_amount(750.0), "750");
        assert_eq!(format_amount(62.5), "62.5");
    }
}
