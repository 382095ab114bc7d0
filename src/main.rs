mod cli;

use adwatch::config::{BotConfig, Method};
use adwatch::types::{NotifyError, StageOutcome};
use adwatch::wallet::WithdrawalOutcome;
use adwatch::{notify, session, tasks, wallet};
use clap::Parser;
use cli::Cli;
use env_logger::Env;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match BotConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    let method = if cli.api { Method::Api } else { config.default_method };
    log::info!("starting run via {method:?}");

    let code = match method {
        Method::Browser => run_browser_pipeline(&cli, &config).await,
        Method::Api => run_api_pipeline(&cli, &config).await,
    };
    std::process::exit(code);
}

/// Full pipeline through the browser: login, task loop, wallet, proof and
/// notify. Only login failure aborts; every later stage reports an outcome.
async fn run_browser_pipeline(cli: &Cli, config: &BotConfig) -> i32 {
    let mut session = match session::establish_browser(config).await {
        Ok(session) => session,
        Err(e) => {
            log::error!("login failed: {e}");
            return 1;
        }
    };

    let mut outcomes: Vec<(&str, StageOutcome)> = Vec::new();

    let task_outcome = match tasks::run_browser_loop(&mut session, config).await {
        Ok(report) if report.succeeded() => StageOutcome::Success,
        Ok(report) => StageOutcome::Failed(format!(
            "{} completed, {} abandoned, exhausted={}",
            report.completed, report.abandoned, report.exhausted
        )),
        Err(e) => StageOutcome::Failed(e.to_string()),
    };
    let proceed = task_outcome.allows_downstream(cli.complete);
    outcomes.push(("tasks", task_outcome));

    if proceed {
        let (wallet_outcome, wallet_note) =
            match wallet::check_and_withdraw_browser(&mut session, config).await {
                Ok(outcome) => (stage_from_withdrawal(&outcome), outcome.summary()),
                Err(e) => (StageOutcome::Failed(e.to_string()), "no withdrawal".into()),
            };
        outcomes.push(("wallet", wallet_outcome));

        if cli.skip_whatsapp {
            outcomes.push(("notify", StageOutcome::Skipped("--skip-whatsapp".into())));
        } else {
            let outcome = notify_stage(&mut session, config, &wallet_note).await;
            outcomes.push(("notify", outcome));
        }
    } else {
        log::warn!("task loop did not succeed; skipping later stages (pass --complete to force)");
        let reason = "task loop did not succeed".to_string();
        outcomes.push(("wallet", StageOutcome::Skipped(reason.clone())));
        outcomes.push(("notify", StageOutcome::Skipped(reason)));
    }

    if let Err(e) = session.browser.shutdown().await {
        log::warn!("browser shutdown failed: {e}");
    }

    summarize(&outcomes)
}

/// Pipeline over the site API. A browser is only brought up when the
/// WhatsApp stage runs, so `--api --skip-whatsapp` never opens a window.
async fn run_api_pipeline(cli: &Cli, config: &BotConfig) -> i32 {
    let api_session = match session::establish_api(config).await {
        Ok(session) => session,
        Err(e) => {
            log::error!("login failed: {e}");
            return 1;
        }
    };

    let mut outcomes: Vec<(&str, StageOutcome)> = Vec::new();

    let task_outcome = match tasks::run_api_loop(&api_session, config).await {
        Ok(report) if report.succeeded() => StageOutcome::Success,
        Ok(report) => StageOutcome::Failed(format!(
            "{} completed, {} abandoned, exhausted={}",
            report.completed, report.abandoned, report.exhausted
        )),
        Err(e) => StageOutcome::Failed(e.to_string()),
    };
    let proceed = task_outcome.allows_downstream(cli.complete);
    outcomes.push(("tasks", task_outcome));

    if proceed {
        let (wallet_outcome, wallet_note) =
            match wallet::check_and_withdraw_api(&api_session, config).await {
                Ok(outcome) => (stage_from_withdrawal(&outcome), outcome.summary()),
                Err(e) => (StageOutcome::Failed(e.to_string()), "no withdrawal".into()),
            };
        outcomes.push(("wallet", wallet_outcome));

        if cli.skip_whatsapp {
            outcomes.push(("notify", StageOutcome::Skipped("--skip-whatsapp".into())));
        } else {
            // Proof capture and WhatsApp need a real page, so a browser
            // session is established just for this stage.
            let outcome = match session::establish_browser(config).await {
                Ok(mut session) => {
                    let outcome = notify_stage(&mut session, config, &wallet_note).await;
                    if let Err(e) = session.browser.shutdown().await {
                        log::warn!("browser shutdown failed: {e}");
                    }
                    outcome
                }
                Err(e) => StageOutcome::Failed(format!("browser login for notify failed: {e}")),
            };
            outcomes.push(("notify", outcome));
        }
    } else {
        log::warn!("task loop did not succeed; skipping later stages (pass --complete to force)");
        let reason = "task loop did not succeed".to_string();
        outcomes.push(("wallet", StageOutcome::Skipped(reason.clone())));
        outcomes.push(("notify", StageOutcome::Skipped(reason)));
    }

    summarize(&outcomes)
}

async fn notify_stage(
    session: &mut session::BrowserSession,
    config: &BotConfig,
    wallet_note: &str,
) -> StageOutcome {
    let artifact = match notify::capture_proof(session, config, wallet_note).await {
        Ok(artifact) => artifact,
        Err(e) => return StageOutcome::Failed(e.to_string()),
    };

    match notify::send_whatsapp(session, config, &artifact).await {
        Ok(()) => StageOutcome::Success,
        // Sending outside the window is a policy skip, not a malfunction.
        Err(NotifyError::OutsideSendWindow(t)) => {
            StageOutcome::Skipped(format!("current time {t} is outside the send window"))
        }
        Err(e) => StageOutcome::Failed(e.to_string()),
    }
}

fn stage_from_withdrawal(outcome: &WithdrawalOutcome) -> StageOutcome {
    match outcome {
        WithdrawalOutcome::Confirmed { .. } => StageOutcome::Success,
        WithdrawalOutcome::Skipped(reason) => StageOutcome::Skipped(reason.to_string()),
        WithdrawalOutcome::Rejected { .. } | WithdrawalOutcome::TimedOut => {
            StageOutcome::Failed(outcome.summary())
        }
    }
}

/// Logs the per-stage summary and maps it to the process exit code: zero
/// only when no stage failed.
fn summarize(outcomes: &[(&str, StageOutcome)]) -> i32 {
    let mut failed = false;
    for (stage, outcome) in outcomes {
        match outcome {
            StageOutcome::Success => log::info!("stage {stage}: ok"),
            StageOutcome::Skipped(reason) => log::info!("stage {stage}: skipped ({reason})"),
            StageOutcome::Failed(reason) => {
                failed = true;
                log::error!("stage {stage}: failed ({reason})");
            }
        }
    }
    if failed { 1 } else { 0 }
}
