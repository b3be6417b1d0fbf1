use clap::Parser;

/// Command-line options for the auto-sync daemon.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// IMAP server hostname.
    #[arg(long, env = "AUTOSYNC_HOST")]
    pub host: String,

    /// IMAP server port.
    #[arg(long, env = "AUTOSYNC_PORT", default_value_t = 993)]
    pub port: u16,

    /// IMAP username.
    #[arg(long, env = "AUTOSYNC_USER")]
    pub user: String,

    /// IMAP password. Prefer the env var over the flag on shared machines.
    #[arg(long, env = "AUTOSYNC_PASSWORD")]
    pub password: String,

    /// Folder (mailbox name) to sync; repeat for more than one. Defaults to
    /// just INBOX.
    #[arg(long = "folder", default_value = "INBOX")]
    pub folders: Vec<String>,

    /// Run one discovery/update tick and exit instead of looping forever.
    #[arg(long)]
    pub once: bool,
}
