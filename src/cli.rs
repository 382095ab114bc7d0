use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "adwatch",
    about = "Watches ad tasks, withdraws rewards, and posts proof to a WhatsApp group",
    long_about = None
)]
pub struct Cli {
    /// Run the downstream stages even if no tasks were completed
    #[arg(short = 'c', long)]
    pub complete: bool,

    /// Drive the task loop through the site API instead of the browser
    #[arg(long)]
    pub api: bool,

    /// Skip the WhatsApp proof-and-notify stage
    #[arg(short = 's', long = "skip-whatsapp", visible_alias = "sw")]
    pub skip_whatsapp: bool,
}
