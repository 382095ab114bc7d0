use fantoccini::Locator;
use tokio::time::{Duration, Instant, sleep};

use crate::client::BrowserClient;
use crate::config::BotConfig;
use crate::session::{ApiSession, BrowserSession};
use crate::types::{Task, TaskError};

/// Per-task lifecycle. `Watching` polls the site's credited seconds until
/// the requirement is met or the task stalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Discovering,
    Watching,
    Completed,
}

/// Loop-level lifecycle: `Draining` while tasks may remain, `Exhausted`
/// once discovery comes up empty or progress stalls out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Draining,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Increasing,
    Decreasing,
}

/// Tracks consecutive observations without progress in the expected
/// direction. The first observation never counts as a stall.
#[derive(Debug)]
pub struct StallDetector {
    threshold: u32,
    direction: Direction,
    last: Option<i64>,
    stalls: u32,
}

impl StallDetector {
    /// Detector for counters that should go down (tasks remaining).
    pub fn decreasing(threshold: u32) -> Self {
        Self {
            threshold,
            direction: Direction::Decreasing,
            last: None,
            stalls: 0,
        }
    }

    /// Detector for counters that should go up (seconds watched).
    pub fn increasing(threshold: u32) -> Self {
        Self {
            threshold,
            direction: Direction::Increasing,
            last: None,
            stalls: 0,
        }
    }

    /// Records an observation. Returns true once the configured number of
    /// consecutive no-progress observations has been reached.
    pub fn observe(&mut self, value: i64) -> bool {
        let progressed = match self.last {
            None => true,
            Some(prev) => match self.direction {
                Direction::Increasing => value > prev,
                Direction::Decreasing => value < prev,
            },
        };

        if progressed {
            self.stalls = 0;
        } else {
            self.stalls += 1;
        }
        self.last = Some(value);
        self.stalls >= self.threshold
    }

    /// Counts a failed observation (e.g. the counter could not be read) as
    /// one stalled cycle.
    pub fn penalize(&mut self) -> bool {
        self.stalls += 1;
        self.stalls >= self.threshold
    }

    pub fn stalls(&self) -> u32 {
        self.stalls
    }
}

/// What the task loop accomplished this run.
#[derive(Debug, Clone, Copy)]
pub struct TaskLoopReport {
    pub completed: u32,
    pub abandoned: u32,
    /// True when the site genuinely ran out of tasks, false when the loop
    /// bailed out because progress stalled.
    pub exhausted: bool,
}

impl TaskLoopReport {
    /// The loop gates downstream stages: it succeeded when it drained the
    /// task list and actually completed something.
    pub fn succeeded(&self) -> bool {
        self.exhausted && self.completed > 0
    }
}

/// Outcome of one watch poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchVerdict {
    Continue,
    Done,
    DeadlineExceeded,
    Stalled,
}

/// Decides whether the watch loop keeps polling. The wall-clock ceiling is
/// checked first so a hung player can never hold the loop open, then
/// completion, then the consecutive-poll stall bound.
pub fn watch_verdict(
    elapsed: Duration,
    ceiling: Duration,
    watched_enough: bool,
    stall_tripped: bool,
) -> WatchVerdict {
    if elapsed >= ceiling {
        WatchVerdict::DeadlineExceeded
    } else if watched_enough {
        WatchVerdict::Done
    } else if stall_tripped {
        WatchVerdict::Stalled
    } else {
        WatchVerdict::Continue
    }
}

/// Pulls the first run of digits out of status text like
/// "Currently watched 13 seconds".
pub fn parse_first_number(text: &str) -> Option<i64> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

const REMAINING_COUNTER: Locator<'static> =
    Locator::XPath("//span[text()='Tasks Remaining Today']/preceding-sibling::div//span");
const COMPLETED_COUNTER: Locator<'static> =
    Locator::XPath("//span[text()='Tasks Completed Today']/preceding-sibling::div//span");
const TASK_ITEMS: Locator<'static> = Locator::Css(".task-list .van-list .van-grid .van-grid-item");

/// Reads the completed-today counter; used by the notify stage to annotate
/// the proof screenshot.
pub async fn read_completed_today(browser: &mut BrowserClient) -> Option<u32> {
    let text = browser.element_text(COMPLETED_COUNTER).await.ok()?;
    parse_first_number(&text).and_then(|n| u32::try_from(n).ok())
}

/// Returns to the tier's task list page if the browser has wandered off it.
pub async fn navigate_to_task_list(session: &mut BrowserSession) -> Result<(), TaskError> {
    if session.browser.current_url().await?.contains("taskList") {
        return Ok(());
    }
    log::info!("navigating back to task list");
    let url = session.task_url.clone();
    session.browser.navigate(&url).await?;
    session.browser.wait_for(TASK_ITEMS).await?;
    Ok(())
}

/// Drives the browser task loop until the remaining counter hits zero or
/// progress stalls for the configured number of cycles.
pub async fn run_browser_loop(
    session: &mut BrowserSession,
    config: &BotConfig,
) -> Result<TaskLoopReport, TaskError> {
    log::info!("starting browser task loop");

    let mut stall = StallDetector::decreasing(config.stall_threshold);
    let mut state = LoopState::Draining;
    let mut completed = 0u32;
    let mut abandoned = 0u32;
    let mut exhausted = false;

    while state == LoopState::Draining {
        sleep(Duration::from_secs(3)).await;

        let remaining = match read_remaining(session, config).await {
            Ok(n) => n,
            Err(e) => {
                log::error!("could not read remaining-task counter: {e}");
                session
                    .browser
                    .debug_screenshot(&config.artifact_dir, "tasks-remaining-debug.png")
                    .await;
                if stall.penalize() {
                    state = LoopState::Exhausted;
                }
                continue;
            }
        };
        log::info!("tasks remaining today: {remaining}");

        if remaining == 0 {
            log::info!("all tasks completed for today");
            exhausted = true;
            state = LoopState::Exhausted;
            continue;
        }

        if stall.observe(remaining) {
            log::error!(
                "task count did not decrease for {} cycles, aborting loop",
                stall.stalls()
            );
            state = LoopState::Exhausted;
            continue;
        }

        match run_one_browser_task(session, config).await {
            Ok(()) => {
                completed += 1;
                log::info!("task completed ({completed} so far)");
            }
            Err(e) => {
                abandoned += 1;
                log::error!("task abandoned: {e}");
                session
                    .browser
                    .debug_screenshot(&config.artifact_dir, "task-loop-error.png")
                    .await;
                if let Err(nav) = navigate_to_task_list(session).await {
                    log::error!("could not recover to task list: {nav}");
                    if stall.penalize() {
                        state = LoopState::Exhausted;
                    }
                }
            }
        }
    }

    let report = TaskLoopReport {
        completed,
        abandoned,
        exhausted,
    };
    log::info!(
        "task loop finished: {} completed, {} abandoned, exhausted={}",
        report.completed,
        report.abandoned,
        report.exhausted
    );
    Ok(report)
}

/// Reads the remaining-task counter with bounded retries and backoff.
async fn read_remaining(
    session: &mut BrowserSession,
    config: &BotConfig,
) -> Result<i64, TaskError> {
    let mut last_err = None;
    for attempt in 0..=config.max_poll_retries {
        if attempt > 0 {
            sleep(Duration::from_secs(2 * attempt as u64)).await;
        }
        match session.browser.element_text(REMAINING_COUNTER).await {
            Ok(text) => {
                return parse_first_number(&text).ok_or_else(|| {
                    TaskError::Discovery(format!("unparsable remaining counter '{text}'"))
                });
            }
            Err(e) => {
                log::warn!("remaining counter read failed (attempt {attempt}): {e}");
                last_err = Some(e);
            }
        }
    }
    Err(TaskError::Discovery(
        last_err.map(|e| e.to_string()).unwrap_or_default(),
    ))
}

/// Picks the first valid task in the hall and carries it through watching
/// and submission. A task click can land on the video page directly or
/// bounce to the in-progress list when one is already claimed.
async fn run_one_browser_task(
    session: &mut BrowserSession,
    config: &BotConfig,
) -> Result<(), TaskError> {
    let mut state = TaskState::Discovering;
    log::debug!("task state: {state:?}");

    session.browser.wait_for(TASK_ITEMS).await?;
    let items = session.browser.find_all(TASK_ITEMS).await?;

    let mut chosen = None;
    for item in items {
        let displayed = item.is_displayed().await.unwrap_or(false);
        let has_thumbnail = !item
            .find_all(Locator::Css("img"))
            .await
            .unwrap_or_default()
            .is_empty();
        if displayed && has_thumbnail {
            chosen = Some(item);
            break;
        }
    }

    let item = chosen.ok_or_else(|| {
        TaskError::Discovery("no task items with thumbnails on the list page".into())
    })?;
    session.browser.click(&item).await?;
    sleep(Duration::from_secs(3)).await;

    let url = session.browser.current_url().await?;
    if url.contains("/task/video/") {
        state = TaskState::Watching;
        log::debug!("task state: {state:?}");
        watch_and_submit(session, config).await?;
    } else if url.contains("/myTask") {
        log::info!("redirected to in-progress list, resuming claimed task");
        resume_in_progress_task(session, config).await?;
    } else {
        return Err(TaskError::Discovery(format!(
            "unexpected URL after task click: {url}"
        )));
    }

    state = TaskState::Completed;
    log::debug!("task state: {state:?}");
    Ok(())
}

/// On the in-progress page, the first cell's button reads "Submit" for a
/// claimed-but-unfinished task; clicking it reopens the video page.
async fn resume_in_progress_task(
    session: &mut BrowserSession,
    config: &BotConfig,
) -> Result<(), TaskError> {
    let pane = session
        .browser
        .wait_for(Locator::Css(
            ".van-tabs__content .van-tab__pane:first-child",
        ))
        .await?;
    let button = pane
        .find(Locator::Css(".van-list .van-cell .TaskItem button"))
        .await
        .map_err(|e| TaskError::Discovery(format!("in-progress task button: {e}")))?;

    let label = button.text().await.unwrap_or_default();
    if !label.to_lowercase().contains("submit") {
        return Err(TaskError::Discovery(format!(
            "in-progress task button reads '{label}', not Submit"
        )));
    }

    session.browser.click(&button).await?;
    sleep(Duration::from_secs(3)).await;

    let url = session.browser.current_url().await?;
    if !url.contains("/task/video/") {
        return Err(TaskError::Discovery(format!(
            "did not reach the video page from the in-progress list: {url}"
        )));
    }
    watch_and_submit(session, config).await
}

/// Starts playback, polls credited seconds until the requirement is met,
/// then clicks the submit button. Bounded by both a no-progress poll count
/// and a wall-clock ceiling.
async fn watch_and_submit(
    session: &mut BrowserSession,
    config: &BotConfig,
) -> Result<(), TaskError> {
    start_video_playback(&mut session.browser).await;

    let required = read_required_seconds(&mut session.browser).await;
    let mut task = Task::new(0, required);
    log::info!("required watch time: {required} seconds");

    let started = Instant::now();
    let ceiling = Duration::from_secs(config.max_watch_secs);
    let mut stall = StallDetector::increasing(config.watch_stall_polls);

    loop {
        let (watched_enough, stall_tripped) = match read_watched_seconds(&mut session.browser).await
        {
            Some(watched) => {
                if watched != task.watched_secs {
                    log::info!("progress: {watched}/{required} seconds watched");
                }
                task.watched_secs = watched;
                let enough = task.watched_enough();
                (enough, !enough && stall.observe(watched as i64))
            }
            None => (false, stall.penalize()),
        };

        match watch_verdict(started.elapsed(), ceiling, watched_enough, stall_tripped) {
            WatchVerdict::Done => break,
            WatchVerdict::DeadlineExceeded => {
                return Err(TaskError::Poll(format!(
                    "watch time ceiling reached at {}/{} seconds",
                    task.watched_secs, task.required_secs
                )));
            }
            WatchVerdict::Stalled => {
                return Err(TaskError::Poll(format!(
                    "watch progress stuck at {} seconds for {} polls",
                    task.watched_secs,
                    stall.stalls()
                )));
            }
            WatchVerdict::Continue => sleep(Duration::from_secs(1)).await,
        }
    }

    task.completed = true;
    submit_completed_task(&mut session.browser).await
}

/// Best-effort playback start: VideoJS play buttons first, then a raw
/// `<video>` element, then checking whether the status text already ticks.
async fn start_video_playback(browser: &mut BrowserClient) {
    let play_buttons = [
        Locator::Css(".video-js .vjs-big-play-button"),
        Locator::Css(".vjs-big-play-button"),
        Locator::Css(".vjs-play-control"),
    ];

    if let Some(button) = browser.first_visible(&play_buttons).await {
        if browser.click(&button).await.is_ok() {
            log::info!("video play button clicked");
            sleep(Duration::from_secs(3)).await;
            return;
        }
    }

    let started = browser
        .execute(
            "const v = document.querySelector('video'); if (v) { v.play(); return true; } return false;",
            vec![],
        )
        .await
        .ok()
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if started {
        log::info!("video started via play()");
        sleep(Duration::from_secs(3)).await;
    } else {
        log::warn!("no play control found, relying on autoplay");
        sleep(Duration::from_secs(2)).await;
    }
}

async fn read_required_seconds(browser: &mut BrowserClient) -> u32 {
    const DEFAULT_REQUIRED_SECS: u32 = 10;

    let requirement = browser
        .element_text(Locator::XPath(
            "//p[contains(text(), 'Watch') and contains(text(), 'seconds')]",
        ))
        .await;

    match requirement {
        Ok(text) => parse_first_number(&text)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(DEFAULT_REQUIRED_SECS),
        Err(_) => {
            log::warn!("task requirement text not found, assuming {DEFAULT_REQUIRED_SECS} seconds");
            DEFAULT_REQUIRED_SECS
        }
    }
}

async fn read_watched_seconds(browser: &mut BrowserClient) -> Option<u32> {
    let elements = browser
        .find_all(Locator::XPath(
            "//p[contains(text(), 'Currently watched') and contains(text(), 'seconds')]",
        ))
        .await
        .ok()?;
    let text = elements.first()?.text().await.ok()?;
    parse_first_number(&text).and_then(|n| u32::try_from(n).ok())
}

/// Finds and clicks the submit button, skipping the neighboring reset
/// button, then waits for navigation away from the video page.
async fn submit_completed_task(browser: &mut BrowserClient) -> Result<(), TaskError> {
    let candidates = [
        Locator::XPath("//button[contains(., 'Submit Complete Task')]"),
        Locator::Css(".button-container .mybutton"),
        Locator::XPath("//button[contains(., 'Submit')]"),
    ];

    let mut submit = None;
    for locator in candidates {
        let Ok(elements) = browser.find_all(locator).await else {
            continue;
        };
        for el in elements {
            if !el.is_displayed().await.unwrap_or(false) {
                continue;
            }
            let text = el.text().await.unwrap_or_default().to_lowercase();
            if text.contains("reset") {
                continue;
            }
            submit = Some(el);
            break;
        }
        if submit.is_some() {
            break;
        }
    }

    let submit =
        submit.ok_or_else(|| TaskError::Poll("submit button not found on video page".into()))?;
    browser.click(&submit).await?;
    log::info!("submit button clicked");

    for _ in 0..15 {
        if !browser.current_url().await?.contains("/task/video/") {
            log::info!("task submission accepted");
            return Ok(());
        }
        sleep(Duration::from_secs(1)).await;
    }

    Err(TaskError::Poll(
        "page did not leave the video URL after submission".into(),
    ))
}

/// Drives the task loop over the site API: fetch the list, claim the first
/// task, submit it, repeat. Claim conflicts fall back to the in-progress
/// order list, mirroring the browser path's redirect handling.
pub async fn run_api_loop(
    session: &ApiSession,
    config: &BotConfig,
) -> Result<TaskLoopReport, TaskError> {
    log::info!("starting API task loop");

    let mut stall = StallDetector::decreasing(config.stall_threshold);
    let mut state = LoopState::Draining;
    let mut completed = 0u32;
    let mut abandoned = 0u32;
    let mut exhausted = false;

    while state == LoopState::Draining {
        let list = match fetch_task_list(session, config).await {
            Ok(list) => list,
            Err(e) => {
                log::error!("task discovery failed after retries: {e}");
                if stall.penalize() {
                    state = LoopState::Exhausted;
                }
                continue;
            }
        };

        let remaining = list.remaining();
        log::info!("tasks remaining: {remaining}");

        if remaining == 0 || list.list.is_empty() {
            log::info!("no tasks available via API");
            exhausted = true;
            state = LoopState::Exhausted;
            continue;
        }

        if stall.observe(remaining) {
            log::error!(
                "task count did not decrease for {} cycles, aborting loop",
                stall.stalls()
            );
            state = LoopState::Exhausted;
            continue;
        }

        let row = &list.list[0];
        let seconds = row.seconds.unwrap_or(11);
        log::info!("processing task {} via API", row.id);

        match session
            .api
            .receive_task(row.id, session.task_num, session.level)
            .await
        {
            Ok(()) => {
                if let Err(e) = session.api.submit_task(row.id, seconds).await {
                    abandoned += 1;
                    log::warn!("failed to submit task {}: {e}", row.id);
                } else {
                    completed += 1;
                    log::info!("task {} submitted", row.id);
                }
            }
            Err(e) => {
                log::warn!("failed to claim task {}: {e}", row.id);
                match resume_in_progress_api(session, seconds).await {
                    Ok(true) => completed += 1,
                    Ok(false) => abandoned += 1,
                    Err(e) => {
                        abandoned += 1;
                        log::warn!("in-progress recovery failed: {e}");
                    }
                }
            }
        }

        // The site credits the submission asynchronously.
        sleep(Duration::from_secs(10)).await;
    }

    let report = TaskLoopReport {
        completed,
        abandoned,
        exhausted,
    };
    log::info!(
        "API task loop finished: {} completed, {} abandoned, exhausted={}",
        report.completed,
        report.abandoned,
        report.exhausted
    );
    Ok(report)
}

async fn fetch_task_list(
    session: &ApiSession,
    config: &BotConfig,
) -> Result<crate::api::TaskListData, TaskError> {
    let mut last_err = None;
    for attempt in 0..=config.max_poll_retries {
        if attempt > 0 {
            sleep(Duration::from_secs(2 * attempt as u64)).await;
        }
        match session.api.task_list(session.task_num, session.level).await {
            Ok(list) => return Ok(list),
            Err(e) => {
                log::warn!("task list fetch failed (attempt {attempt}): {e}");
                last_err = Some(e);
            }
        }
    }
    Err(TaskError::Discovery(
        last_err.map(|e| e.to_string()).unwrap_or_default(),
    ))
}

/// Submits the first claimed-but-unfinished task, if any. Returns whether
/// one was completed.
async fn resume_in_progress_api(session: &ApiSession, seconds: u32) -> Result<bool, TaskError> {
    let orders = session.api.in_progress_tasks().await?;
    let Some(order) = orders.first() else {
        return Ok(false);
    };
    log::info!("submitting in-progress task {}", order.task_id);
    session.api.submit_task(order.task_id, seconds).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_detector_trips_after_threshold_without_progress() {
        let mut stall = StallDetector::decreasing(3);
        assert!(!stall.observe(5)); // first observation is free
        assert!(!stall.observe(5));
        assert!(!stall.observe(5));
        assert!(stall.observe(5));
    }

    #[test]
    fn stall_detector_resets_on_progress() {
        let mut stall = StallDetector::decreasing(3);
        assert!(!stall.observe(5));
        assert!(!stall.observe(5));
        assert!(!stall.observe(4)); // progress resets the count
        assert_eq!(stall.stalls(), 0);
        assert!(!stall.observe(4));
        assert!(!stall.observe(4));
        assert!(stall.observe(4));
    }

    #[test]
    fn increasing_detector_treats_decrease_as_stall() {
        let mut stall = StallDetector::increasing(2);
        assert!(!stall.observe(3));
        assert!(!stall.observe(2));
        assert!(stall.observe(2));
    }

    #[test]
    fn penalize_counts_toward_the_threshold() {
        let mut stall = StallDetector::decreasing(2);
        assert!(!stall.penalize());
        assert!(stall.penalize());
    }

    #[test]
    fn watch_ceiling_bounds_wall_clock() {
        let ceiling = Duration::from_secs(600);
        assert_eq!(
            watch_verdict(Duration::from_secs(600), ceiling, false, false),
            WatchVerdict::DeadlineExceeded
        );
        // the ceiling outranks every other signal once reached
        assert_eq!(
            watch_verdict(Duration::from_secs(601), ceiling, true, true),
            WatchVerdict::DeadlineExceeded
        );
        assert_eq!(
            watch_verdict(Duration::from_secs(599), ceiling, false, false),
            WatchVerdict::Continue
        );
    }

    #[test]
    fn finished_watch_outranks_a_stall() {
        let ceiling = Duration::from_secs(600);
        assert_eq!(
            watch_verdict(Duration::ZERO, ceiling, true, false),
            WatchVerdict::Done
        );
        assert_eq!(
            watch_verdict(Duration::ZERO, ceiling, false, true),
            WatchVerdict::Stalled
        );
    }

    #[test]
    fn parses_numbers_from_status_text() {
        assert_eq!(parse_first_number("Currently watched 13 seconds"), Some(13));
        assert_eq!(parse_first_number("Watch 10 seconds"), Some(10));
        assert_eq!(parse_first_number("no digits here"), None);
        assert_eq!(parse_first_number("7"), Some(7));
    }

    #[test]
    fn loop_report_requires_drain_and_completions() {
        let drained = TaskLoopReport {
            completed: 2,
            abandoned: 0,
            exhausted: true,
        };
        assert!(drained.succeeded());

        let stalled_out = TaskLoopReport {
            completed: 2,
            abandoned: 1,
            exhausted: false,
        };
        assert!(!stalled_out.succeeded());

        let nothing_done = TaskLoopReport {
            completed: 0,
            abandoned: 0,
            exhausted: true,
        };
        assert!(!nothing_done.succeeded());
    }
}
