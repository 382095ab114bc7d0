use std::fs;

use chrono::{Local, NaiveTime};
use fantoccini::Locator;
use rand::seq::SliceRandom;
use tokio::time::{Duration, sleep};

use crate::config::BotConfig;
use crate::session::BrowserSession;
use crate::tasks::{self, read_completed_today};
use crate::types::{NotifyError, ProofArtifact};

const WHATSAPP_URL: &str = "https://web.whatsapp.com";

/// Rotating proof captions, so daily posts to the group do not all read
/// the same.
const CAPTIONS: &[&str] = &[
    "Done with today's tasks!",
    "All tasks completed for today.",
    "Finished my daily tasks, proof attached.",
    "Today's work is done, screenshot attached.",
    "Tasks done for the day!",
];

/// The banner WhatsApp shows in announcement-only groups.
const ADMIN_ONLY_BANNER: &str = "only admins can send messages";

/// True when `now` falls inside the configured send window, inclusive on
/// both ends.
pub fn within_send_window(now: NaiveTime, window: (NaiveTime, NaiveTime)) -> bool {
    now >= window.0 && now <= window.1
}

fn pick_caption() -> &'static str {
    CAPTIONS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(CAPTIONS[0])
}

/// Returns to the task list, waits for thumbnails to render and captures
/// the proof screenshot.
pub async fn capture_proof(
    session: &mut BrowserSession,
    config: &BotConfig,
    wallet_note: &str,
) -> Result<ProofArtifact, NotifyError> {
    log::info!("capturing proof screenshot");

    tasks::navigate_to_task_list(session)
        .await
        .map_err(|e| NotifyError::Capture(e.to_string()))?;

    // Half-loaded thumbnails make the proof look fake; give them a bounded
    // window to finish.
    match session
        .browser
        .wait_for_images(Duration::from_secs(10))
        .await
    {
        Ok(true) => {}
        Ok(false) => log::warn!("some images never finished loading, capturing anyway"),
        Err(e) => log::warn!("image readiness check failed ({e}), capturing anyway"),
    }

    let tasks_completed = read_completed_today(&mut session.browser).await;
    if let Some(count) = tasks_completed {
        log::info!("completed-today counter reads {count}");
    }

    let path = session
        .browser
        .capture_screenshot(&config.artifact_dir, "proof")
        .await
        .map_err(|e| NotifyError::Capture(e.to_string()))?;
    log::info!("proof saved to {}", path.display());

    let mut caption = pick_caption().to_string();
    if let Some(count) = tasks_completed {
        caption.push_str(&format!(" ({count} tasks completed)"));
    }
    if !wallet_note.is_empty() {
        caption.push_str(&format!(" - {wallet_note}"));
    }

    Ok(ProofArtifact {
        path,
        captured_at: Local::now(),
        group: config.whatsapp_group.clone(),
        tasks_completed,
        caption,
    })
}

/// Posts the proof screenshot with its caption to the configured WhatsApp
/// group via WhatsApp Web in a second tab. The send-window check happens
/// before any page interaction.
pub async fn send_whatsapp(
    session: &mut BrowserSession,
    config: &BotConfig,
    artifact: &ProofArtifact,
) -> Result<(), NotifyError> {
    let now = Local::now().time();
    if !within_send_window(now, config.send_window) {
        return Err(NotifyError::OutsideSendWindow(now));
    }

    log::info!("opening WhatsApp Web to notify '{}'", artifact.group);
    session.browser.open_tab(WHATSAPP_URL).await?;

    let result = send_in_current_tab(session, config, artifact).await;

    // The site session lives in the first tab; always hand control back.
    if let Err(e) = session.browser.switch_to_first_tab().await {
        log::warn!("could not switch back to the site tab: {e}");
    }

    result
}

async fn send_in_current_tab(
    session: &mut BrowserSession,
    config: &BotConfig,
    artifact: &ProofArtifact,
) -> Result<(), NotifyError> {
    let browser = &mut session.browser;

    // WhatsApp Web takes a while to restore the session after load.
    let search = async {
        for attempt in 1..=6 {
            if let Some(el) = browser
                .try_wait_for(Locator::Css("div[contenteditable='true'][data-tab='3']"))
                .await
            {
                return Some(el);
            }
            log::info!("waiting for WhatsApp Web to load (attempt {attempt}/6)");
            sleep(Duration::from_secs(5)).await;
        }
        None
    }
    .await
    .ok_or_else(|| NotifyError::SendUnconfirmed("WhatsApp Web never finished loading".into()))?;

    browser.fill(&search, &artifact.group).await?;
    sleep(Duration::from_secs(2)).await;

    let group_xpath = format!("//span[@title='{}']", artifact.group);
    let mut opened = false;
    for attempt in 1..=3 {
        if browser
            .click_locator(Locator::XPath(&group_xpath))
            .await
            .is_ok()
        {
            opened = true;
            break;
        }
        log::warn!("group '{}' not in results (attempt {attempt}/3)", artifact.group);
        sleep(Duration::from_secs(2)).await;
    }
    if !opened {
        return Err(NotifyError::TargetNotFound(artifact.group.clone()));
    }
    sleep(Duration::from_secs(2)).await;

    let page = browser.source().await?.to_lowercase();
    if page.contains(ADMIN_ONLY_BANNER) {
        return Err(NotifyError::PermissionDenied);
    }

    attach_image(browser, artifact).await?;

    // Caption box appears in the attachment preview.
    let caption_box = browser
        .first_visible(&[
            Locator::Css("div[contenteditable='true'][data-tab='10']"),
            Locator::XPath("//div[@contenteditable='true' and @role='textbox']"),
        ])
        .await;
    match caption_box {
        Some(el) => browser.fill(&el, &artifact.caption).await?,
        None => log::warn!("caption box not found, sending image without caption"),
    }

    browser
        .click_locator(Locator::Css("span[data-icon='send']"))
        .await
        .map_err(|e| NotifyError::SendUnconfirmed(format!("send button: {e}")))?;
    log::info!("message submitted, waiting for delivery tick");

    confirm_sent(browser, config).await
}

async fn attach_image(
    browser: &mut crate::client::BrowserClient,
    artifact: &ProofArtifact,
) -> Result<(), NotifyError> {
    let attach_button = browser
        .first_visible(&[
            Locator::Css("span[data-icon='plus']"),
            Locator::Css("span[data-icon='attach-menu-plus']"),
            Locator::Css("div[title='Attach']"),
        ])
        .await
        .ok_or_else(|| NotifyError::SendUnconfirmed("attach button not found".into()))?;
    browser.click(&attach_button).await?;
    sleep(Duration::from_secs(1)).await;

    // File inputs take the absolute path directly, no OS file dialog needed.
    let absolute = fs::canonicalize(&artifact.path)
        .map_err(|e| NotifyError::Capture(format!("{}: {e}", artifact.path.display())))?;

    let file_input = browser
        .first_visible(&[
            Locator::Css("input[accept*='image']"),
            Locator::Css("input[type='file']"),
        ])
        .await
        .ok_or_else(|| NotifyError::SendUnconfirmed("file input not found".into()))?;
    file_input
        .send_keys(&absolute.to_string_lossy())
        .await
        .map_err(|e| NotifyError::SendUnconfirmed(format!("file input: {e}")))?;

    sleep(Duration::from_secs(3)).await;
    Ok(())
}

/// Watches the last message bubble for a delivery indicator. A pending
/// clock icon that never resolves counts as unconfirmed.
async fn confirm_sent(
    browser: &mut crate::client::BrowserClient,
    config: &BotConfig,
) -> Result<(), NotifyError> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(config.confirm_timeout_secs);

    while tokio::time::Instant::now() < deadline {
        for icon in ["msg-check", "msg-dblcheck"] {
            let selector = format!(
                "div[class*='message-out']:last-child span[data-icon='{icon}']"
            );
            if let Ok(found) = browser.find_all(Locator::Css(&selector)).await {
                if !found.is_empty() {
                    log::info!("message delivered ({icon})");
                    return Ok(());
                }
            }
        }
        sleep(Duration::from_secs(2)).await;
    }

    Err(NotifyError::SendUnconfirmed(
        "no delivery tick appeared on the sent message".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> (NaiveTime, NaiveTime) {
        (
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
        )
    }

    #[test]
    fn send_window_bounds_are_inclusive() {
        assert!(within_send_window(
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            window()
        ));
        assert!(within_send_window(
            NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            window()
        ));
        assert!(within_send_window(
            NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            window()
        ));
    }

    #[test]
    fn outside_send_window_is_rejected() {
        assert!(!within_send_window(
            NaiveTime::from_hms_opt(9, 29, 59).unwrap(),
            window()
        ));
        assert!(!within_send_window(
            NaiveTime::from_hms_opt(20, 0, 1).unwrap(),
            window()
        ));
        assert!(!within_send_window(
            NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
            window()
        ));
    }

    #[test]
    fn caption_pool_is_nonempty_and_distinct() {
        assert!(CAPTIONS.len() >= 5);
        for caption in CAPTIONS {
            assert!(!caption.is_empty());
        }
        let picked = pick_caption();
        assert!(CAPTIONS.contains(&picked));
    }
}
