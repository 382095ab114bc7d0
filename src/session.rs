use fantoccini::Locator;
use tokio::time::{Duration, sleep};

use crate::api::{ApiClient, ApiError};
use crate::client::{BrowserClient, BrowserError, BrowserOptions};
use crate::config::BotConfig;
use crate::types::AuthError;

/// Account tiers the task hall distinguishes, in the order the site lists
/// them on the account page.
pub const IDENTITY_TIERS: &[&str] = &[
    "Internship",
    "VIP1",
    "VIP2",
    "VIP3",
    "VIP4",
    "VIP5",
    "VIP6",
    "VIP7",
    "VIP8",
    "VIP9",
];

const LOGIN_ERROR_PHRASES: &[&str] = &[
    // Filipino first, matching the site's default locale
    "mali ang password",
    "mali ang numero",
    "hindi mahanap ang account",
    "nabigo ang pag-login",
    "wrong password",
    "wrong number",
    "account not found",
    "login failed",
    "invalid credentials",
];

const LOGIN_SUCCESS_MARKERS: &[&str] = &[
    "task hall",
    "welcome",
    "matagumpay",
    "internship",
    "piliin ang wika",
];

/// An authenticated, English-language browser session parked on the task
/// list page.
pub struct BrowserSession {
    pub browser: BrowserClient,
    /// The task list URL for this account's tier, revisited by later stages.
    pub task_url: String,
}

/// An authenticated API session.
pub struct ApiSession {
    pub api: ApiClient,
    pub level: i64,
    pub task_num: i64,
}

/// Logs into the site API. Site-level rejections are bad credentials;
/// transport problems are network failures. Both are fatal to the run.
pub async fn establish_api(config: &BotConfig) -> Result<ApiSession, AuthError> {
    log::info!("logging in via API as {}", config.username);

    let mut api =
        ApiClient::new(&config.api_base_url, &config.website_url).map_err(AuthError::Api)?;

    let login = match api.login(&config.username, &config.password).await {
        Ok(data) => data,
        Err(ApiError::Site { msg, .. }) => return Err(AuthError::BadCredentials(msg)),
        Err(e @ ApiError::Transport { .. }) => return Err(AuthError::Network(e.to_string())),
        Err(e) => return Err(AuthError::Api(e)),
    };

    log::info!(
        "API login succeeded; identity {} (level {})",
        login.useridentity,
        login.level
    );

    Ok(ApiSession {
        api,
        level: login.level,
        task_num: login.task_num,
    })
}

/// Connects a browser, logs in, normalizes the language, resolves the
/// account tier and parks on that tier's task list.
pub async fn establish_browser(config: &BotConfig) -> Result<BrowserSession, AuthError> {
    let options = BrowserOptions::new()
        .webdriver_url(&config.webdriver_url)
        .window_size(735, 1080);

    let mut browser = BrowserClient::connect(options)
        .await
        .map_err(|e| AuthError::Network(e.to_string()))?;

    if let Err(e) = login(&mut browser, config).await {
        browser
            .debug_screenshot(&config.artifact_dir, "login-failure.png")
            .await;
        shutdown_quietly(browser).await;
        return Err(e);
    }

    change_language_to_english(&mut browser).await;

    let identity = check_identity(&mut browser, &config.default_identity).await;
    log::info!("account identity: {identity}");

    let task_url = match open_task_hall(&mut browser, &identity).await {
        Ok(url) => url,
        Err(e) => {
            shutdown_quietly(browser).await;
            return Err(e);
        }
    };
    log::info!("task list ready at {task_url}");

    Ok(BrowserSession { browser, task_url })
}

/// The WebDriver session outlives a dropped client, so failed establishment
/// closes it explicitly before propagating the error.
async fn shutdown_quietly(browser: BrowserClient) {
    if let Err(e) = browser.shutdown().await {
        log::warn!("browser shutdown after failed session setup also failed: {e}");
    }
}

async fn login(browser: &mut BrowserClient, config: &BotConfig) -> Result<(), AuthError> {
    log::info!("navigating to {}", config.website_url);
    browser.navigate(&config.website_url).await?;
    browser.wait_for(Locator::Css("body")).await?;
    sleep(Duration::from_secs(3)).await;

    // The login form lives behind a dialog button on first load. If the
    // button is gone the form may already be visible, so keep going.
    if let Some(dialog) = browser.try_wait_for(Locator::Css(".van-button")).await {
        log::info!("revealing login form");
        let _ = browser.click(&dialog).await;
        sleep(Duration::from_secs(2)).await;
    }

    let username_field = browser
        .first_visible(&[
            Locator::Css("input[type='tel']"),
            Locator::Css("input[placeholder*='Telepono']"),
            Locator::Css("input[name='username']"),
            Locator::Css("input[name='mobile']"),
            Locator::Css(".van-field input"),
        ])
        .await
        .ok_or_else(|| AuthError::LayoutMismatch("phone/username field not found".into()))?;

    let password_field = browser
        .first_visible(&[
            Locator::Css("input[type='password']"),
            Locator::Css("input[placeholder*='Password']"),
            Locator::Css(".van-field__control"),
        ])
        .await
        .ok_or_else(|| AuthError::LayoutMismatch("password field not found".into()))?;

    browser.fill(&username_field, &config.username).await?;
    browser.fill(&password_field, &config.password).await?;
    log::info!("credentials entered");

    let login_button = browser
        .first_visible(&[
            Locator::XPath("//button[contains(., 'Mag-log in Ngayon')]"),
            Locator::XPath("//button[contains(., 'Mag-login')]"),
            Locator::XPath("//button[contains(., 'Login')]"),
            Locator::Css("button[type='submit']"),
            Locator::Css(".van-button--danger"),
        ])
        .await;

    match login_button {
        Some(button) => browser.click(&button).await?,
        None => {
            log::warn!("login button not found, submitting via Enter");
            password_field
                .send_keys("\n")
                .await
                .map_err(|e| BrowserError::OperationError(e.to_string()))?;
        }
    }
    log::info!("login form submitted");

    // Rejections surface as short-lived toasts before the page reacts.
    sleep(Duration::from_secs(2)).await;
    for toast in browser.visible_toasts().await? {
        let lowered = toast.to_lowercase();
        if LOGIN_ERROR_PHRASES.iter().any(|p| lowered.contains(p)) {
            return Err(AuthError::BadCredentials(toast));
        }
        log::warn!("toast during login: '{toast}'");
    }

    sleep(Duration::from_secs(3)).await;
    let page = browser.source().await?.to_lowercase();

    if LOGIN_SUCCESS_MARKERS.iter().any(|m| page.contains(m)) {
        log::info!("login succeeded");
        return Ok(());
    }

    // A still-visible confirm button means the dialog never went away.
    for confirm in browser.find_all(Locator::Css(".van-dialog__confirm")).await? {
        if confirm.is_displayed().await.unwrap_or(false) {
            return Err(AuthError::BadCredentials(
                "login dialog still open after submit".into(),
            ));
        }
    }

    log::warn!("login result unclear, continuing anyway");
    Ok(())
}

/// Switches the site language to English. Bounded and best-effort: the rest
/// of the run tolerates the current language if this fails.
async fn change_language_to_english(browser: &mut BrowserClient) {
    const PICKER: Locator<'static> = Locator::XPath("//span[contains(text(), 'Piliin ang Wika')]");

    for attempt in 1..=3 {
        sleep(Duration::from_secs(2)).await;

        let Some(picker) = browser.try_wait_for(PICKER).await else {
            log::info!("language picker not present, assuming English");
            return;
        };

        log::info!("switching language to English (attempt {attempt}/3)");
        if browser.click(&picker).await.is_err() {
            continue;
        }

        let english = browser
            .try_wait_for(Locator::XPath(
                "//div[contains(@class, 'van-cell--clickable')]//span[text()='English']",
            ))
            .await;

        if let Some(english) = english {
            if browser.click(&english).await.is_ok() {
                sleep(Duration::from_secs(3)).await;
                if browser.try_wait_for(PICKER).await.is_none() {
                    log::info!("language changed to English");
                    return;
                }
            }
        }
    }

    log::warn!("could not change language to English, continuing as-is");
}

/// Reads the account tier from the account page, defaulting when the text
/// cannot be parsed.
async fn check_identity(browser: &mut BrowserClient, default_identity: &str) -> String {
    let found = async {
        browser
            .click_locator(Locator::Css("a[href='#/user']"))
            .await?;
        sleep(Duration::from_secs(3)).await;
        browser
            .element_text(Locator::XPath(
                "//p[text()='Your Identity']/following-sibling::p",
            ))
            .await
    }
    .await;

    match found {
        Ok(text) => IDENTITY_TIERS
            .iter()
            .find(|tier| text.contains(*tier))
            .map(|tier| tier.to_string())
            .unwrap_or_else(|| {
                log::warn!("could not parse identity from '{text}', using default");
                default_identity.to_string()
            }),
        Err(e) => {
            log::warn!("could not read account identity ({e}), using default");
            default_identity.to_string()
        }
    }
}

/// Clicks the tier's button in the task hall and waits for the task list
/// URL to settle.
async fn open_task_hall(
    browser: &mut BrowserClient,
    identity: &str,
) -> Result<String, AuthError> {
    browser.click_locator(Locator::Css("a[href='#/']")).await?;
    sleep(Duration::from_secs(3)).await;
    browser.wait_for(Locator::Css(".TaskHall")).await?;

    let tier_xpath = format!(
        "//div[@class='TaskHall']//div[contains(@class, 'van-grid-item__content') and contains(., '{identity}')]"
    );

    if browser
        .click_locator(Locator::XPath(&tier_xpath))
        .await
        .is_err()
    {
        log::warn!("{identity} button not found, clicking first task hall entry");
        browser
            .click_locator(Locator::Css(".TaskHall .van-grid-item__content"))
            .await?;
    }

    for _ in 0..20 {
        let url = browser.current_url().await?;
        if url.contains("taskList") {
            return Ok(url);
        }
        sleep(Duration::from_secs(1)).await;
    }

    Err(AuthError::LayoutMismatch(
        "task list URL never appeared after clicking the task hall".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Method;
    use chrono::NaiveTime;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const SESSION_ID: &str = "stub-session";

    fn respond(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
    }

    /// Answers just enough of the WebDriver wire protocol to let a session
    /// open and then fail every element lookup.
    fn route(method: &str, path: &str, session_deleted: &AtomicBool) -> String {
        if method == "GET" && path == "/status" {
            return respond("200 OK", r#"{"value":{"ready":true,"message":""}}"#);
        }
        if method == "POST" && path == "/session" {
            return respond(
                "200 OK",
                &format!(r#"{{"value":{{"sessionId":"{SESSION_ID}","capabilities":{{}}}}}}"#),
            );
        }
        if method == "DELETE" && path == format!("/session/{SESSION_ID}") {
            session_deleted.store(true, Ordering::SeqCst);
            return respond("200 OK", r#"{"value":null}"#);
        }
        if path.ends_with("/window/rect") {
            return respond("200 OK", r#"{"value":{"x":0,"y":0,"width":735,"height":1080}}"#);
        }
        if path.ends_with("/window/handles") {
            return respond("200 OK", r#"{"value":["w-1"]}"#);
        }
        if path.ends_with("/url") {
            return respond("200 OK", r#"{"value":null}"#);
        }
        if path.ends_with("/element") || path.ends_with("/elements") {
            return respond(
                "404 Not Found",
                r#"{"value":{"error":"no such element","message":"stub has no elements","stacktrace":""}}"#,
            );
        }
        respond(
            "500 Internal Server Error",
            r#"{"value":{"error":"unknown error","message":"unhandled by stub","stacktrace":""}}"#,
        )
    }

    async fn serve(listener: TcpListener, session_deleted: Arc<AtomicBool>) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let deleted = session_deleted.clone();
            tokio::spawn(async move {
                let mut buf: Vec<u8> = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let header_end = loop {
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    };

                    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
                    let method = request_line.next().unwrap_or_default().to_string();
                    let path = request_line.next().unwrap_or_default().to_string();

                    let content_length = head
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            if name.eq_ignore_ascii_case("content-length") {
                                value.trim().parse::<usize>().ok()
                            } else {
                                None
                            }
                        })
                        .unwrap_or(0);

                    let total = header_end + content_length;
                    while buf.len() < total {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    buf.drain(..total);

                    let response = route(&method, &path, &deleted);
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    }

    fn stub_config(port: u16) -> BotConfig {
        BotConfig {
            username: "639001234567".into(),
            password: "pw".into(),
            fund_password: "fp".into(),
            withdraw_amount: 60.0,
            website_url: "https://site.invalid".into(),
            api_base_url: "https://api.invalid".into(),
            whatsapp_group: "group".into(),
            default_identity: "Internship".into(),
            default_method: Method::Browser,
            webdriver_url: format!("http://127.0.0.1:{port}"),
            artifact_dir: std::env::temp_dir(),
            stall_threshold: 3,
            watch_stall_polls: 15,
            max_watch_secs: 600,
            max_poll_retries: 0,
            confirm_timeout_secs: 1,
            send_window: (
                NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            ),
        }
    }

    #[tokio::test]
    async fn failed_login_closes_the_webdriver_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let session_deleted = Arc::new(AtomicBool::new(false));
        tokio::spawn(serve(listener, session_deleted.clone()));

        let result = establish_browser(&stub_config(port)).await;

        assert!(result.is_err());
        assert!(
            session_deleted.load(Ordering::SeqCst),
            "WebDriver session was left open after the failed login"
        );
    }
}
