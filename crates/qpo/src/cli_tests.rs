use crate::cli::{Cli, Commands};
use clap::Parser;

#[test]
fn scan_defaults_have_no_session_and_comprehensive_on() {
    let cli = Cli::try_parse_from(["qpo", "scan"]).unwrap();
    match cli.command {
        Commands::Scan { session, no_comprehensive } => {
            assert_eq!(session, None);
            assert!(!no_comprehensive);
        }
        other => panic!("expected Scan, got {other:?}"),
    }
}

#[test]
fn scan_accepts_session_and_no_comprehensive() {
    let cli = Cli::try_parse_from(["qpo", "scan", "--session", "s1", "--no-comprehensive"]).unwrap();
    match cli.command {
        Commands::Scan { session, no_comprehensive } => {
            assert_eq!(session, Some("s1".to_string()));
            assert!(no_comprehensive);
        }
        other => panic!("expected Scan, got {other:?}"),
    }
}

#[test]
fn fix_defaults_match_spec_budget() {
    let cli = Cli::try_parse_from(["qpo", "fix"]).unwrap();
    match cli.command {
        Commands::Fix {
            session,
            max_fixes,
            no_auto_apply,
            no_claude_agent,
        } => {
            assert_eq!(session, None);
            assert_eq!(max_fixes, 10);
            assert!(!no_auto_apply);
            assert!(!no_claude_agent);
        }
        other => panic!("expected Fix, got {other:?}"),
    }
}

#[test]
fn fix_overrides_max_fixes_and_flags() {
    let cli = Cli::try_parse_from([
        "qpo",
        "fix",
        "--max-fixes",
        "3",
        "--no-auto-apply",
        "--no-claude-agent",
    ])
    .unwrap();
    match cli.command {
        Commands::Fix {
            max_fixes,
            no_auto_apply,
            no_claude_agent,
            ..
        } => {
            assert_eq!(max_fixes, 3);
            assert!(no_auto_apply);
            assert!(no_claude_agent);
        }
        other => panic!("expected Fix, got {other:?}"),
    }
}

#[test]
fn run_full_defaults_match_spec_budget() {
    let cli = Cli::try_parse_from(["qpo", "run-full"]).unwrap();
    match cli.command {
        Commands::RunFull {
            max_cycles,
            max_fixes_per_cycle,
            no_break_on_no_issues,
            no_comprehensive,
            ..
        } => {
            assert_eq!(max_cycles, 10);
            assert_eq!(max_fixes_per_cycle, 10);
            assert!(!no_break_on_no_issues);
            assert!(!no_comprehensive);
        }
        other => panic!("expected RunFull, got {other:?}"),
    }
}

#[test]
fn status_requires_a_session_argument() {
    assert!(Cli::try_parse_from(["qpo", "status"]).is_err());
    let cli = Cli::try_parse_from(["qpo", "status", "s1"]).unwrap();
    match cli.command {
        Commands::Status { session } => assert_eq!(session, "s1"),
        other => panic!("expected Status, got {other:?}"),
    }
}

#[test]
fn workspace_flag_is_global_and_accepted_after_subcommand() {
    let cli = Cli::try_parse_from(["qpo", "--workspace", "/tmp/ws", "scan"]).unwrap();
    assert_eq!(cli.workspace, Some("/tmp/ws".to_string()));

    let cli = Cli::try_parse_from(["qpo", "scan", "--workspace", "/tmp/ws"]).unwrap();
    assert_eq!(cli.workspace, Some("/tmp/ws".to_string()));
}

#[test]
fn serve_and_compliance_check_take_no_arguments() {
    assert!(matches!(
        Cli::try_parse_from(["qpo", "serve"]).unwrap().command,
        Commands::Serve
    ));
    assert!(matches!(
        Cli::try_parse_from(["qpo", "compliance-check"]).unwrap().command,
        Commands::ComplianceCheck
    ));
}
