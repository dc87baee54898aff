use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "qpo", version)]
#[command(about = "Quality pipeline orchestrator: scan, fix, and re-validate a workspace")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    pub workspace: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scanner and print its lint report
    Scan {
        /// Session id to scan under; generated if omitted
        #[arg(long)]
        session: Option<String>,
        /// Skip the scanner's comprehensive mode
        #[arg(long)]
        no_comprehensive: bool,
    },
    /// Invoke the patcher against a session's latest lint report
    Fix {
        /// Session id to fix; must already have a lint report from `scan`
        #[arg(long)]
        session: Option<String>,
        /// Maximum number of fixes to apply this call
        #[arg(long, default_value_t = 10)]
        max_fixes: u32,
        /// Report fixes without writing them to disk
        #[arg(long)]
        no_auto_apply: bool,
        /// Don't route fixes through the Claude agent backend
        #[arg(long)]
        no_claude_agent: bool,
    },
    /// Drive the full scan -> fix -> validate cycle machine
    RunFull {
        /// Session id to drive; generated if omitted
        #[arg(long)]
        session: Option<String>,
        /// Maximum scan/fix/validate cycles before giving up
        #[arg(long, default_value_t = 10)]
        max_cycles: u32,
        /// Maximum fixes applied per cycle
        #[arg(long, default_value_t = 10)]
        max_fixes_per_cycle: u32,
        /// Keep cycling even if the first scan finds nothing
        #[arg(long)]
        no_break_on_no_issues: bool,
        /// Skip the scanner's comprehensive mode
        #[arg(long)]
        no_comprehensive: bool,
    },
    /// Print a session's current snapshot
    Status {
        /// Session id to inspect
        session: String,
    },
    /// Start the stdio MCP tool server
    Serve,
    /// Print this server's MCP feature introspection as JSON
    ComplianceCheck,
}
