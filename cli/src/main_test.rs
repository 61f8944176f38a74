use super::*;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("nightctl").chain(args.iter().copied())).expect("arguments should parse")
}

// =============================================================================
// SOCKET URL
// =============================================================================

#[test]
fn ws_url_maps_http_to_ws() {
    let url = ws_url("http://127.0.0.1:3000", None).expect("url");
    assert_eq!(url, "ws://127.0.0.1:3000/api/ws");
}

#[test]
fn ws_url_maps_https_to_wss_and_trims_slash() {
    let url = ws_url("https://night.example/", None).expect("url");
    assert_eq!(url, "wss://night.example/api/ws");
}

#[test]
fn ws_url_encodes_page_url() {
    let url = ws_url("http://127.0.0.1:3000", Some("https://a.com/x?y=1")).expect("url");
    assert_eq!(url, "ws://127.0.0.1:3000/api/ws?url=https%3A%2F%2Fa.com%2Fx%3Fy%3D1");
}

#[test]
fn ws_url_rejects_unknown_scheme() {
    let err = ws_url("ftp://127.0.0.1", None).expect_err("scheme should fail");
    assert!(matches!(err, CliError::InvalidBaseUrl(_)));
}

// =============================================================================
// ARGUMENTS
// =============================================================================

#[test]
fn theme_accepts_dark_and_light() {
    let cli = parse(&["theme", "dark"]);
    assert!(matches!(cli.command, Command::Theme { scheme: Scheme::Dark }));
    let cli = parse(&["theme", "light"]);
    assert!(matches!(cli.command, Command::Theme { scheme: Scheme::Light }));
    assert!(Scheme::Dark.is_dark());
    assert!(!Scheme::Light.is_dark());
}

#[test]
fn call_parses_syscall_name() {
    let cli = parse(&["call", "TOGGLE_NIGHT_MODE"]);
    let Command::Call(args) = cli.command else {
        panic!("expected call command");
    };
    assert_eq!(args.syscall, Syscall::ToggleNightMode);
    assert_eq!(args.data, "{}");
}

#[test]
fn call_rejects_unknown_syscall() {
    let result = Cli::try_parse_from(["nightctl", "call", "REBOOT"]);
    assert!(result.is_err());
}

#[test]
fn site_set_requires_a_source() {
    assert!(Cli::try_parse_from(["nightctl", "site", "set", "a.com"]).is_err());
    assert!(
        Cli::try_parse_from(["nightctl", "site", "set", "a.com", "--json", "{}", "--file", "x.json"]).is_err()
    );

    let cli = parse(&["site", "set", "a.com", "--json", r#"{"enabled":true}"#]);
    let Command::Site(SiteCommand { command: SiteSubcommand::Set { host, json, file } }) = cli.command else {
        panic!("expected site set");
    };
    assert_eq!(host, "a.com");
    assert!(file.is_none());
    assert_eq!(json.as_deref(), Some(r#"{"enabled":true}"#));
}

#[test]
fn base_url_has_local_default() {
    let cli = Cli::try_parse_from(["nightctl", "--base-url", "http://10.0.0.2:3000", "toggle"]).expect("parse");
    assert_eq!(cli.base_url, "http://10.0.0.2:3000");
    assert!(matches!(cli.command, Command::Toggle));
}

// =============================================================================
// PAGE BEHAVIOR
// =============================================================================

#[test]
fn acknowledge_answers_apply_and_remove() {
    let apply = Frame::request(Syscall::ApplyNightMode, Data::new());
    let ack = acknowledge(&apply).expect("apply is acknowledged");
    assert!(ack.is_reply_to(&apply));
    assert_eq!(ack.status, Status::Done);
    assert_eq!(ack.data.get("success"), Some(&Value::Bool(true)));

    let remove = Frame::request(Syscall::RemoveNightMode, Data::new());
    assert!(acknowledge(&remove).is_some());
}

#[test]
fn acknowledge_ignores_replies_and_other_syscalls() {
    let apply = Frame::request(Syscall::ApplyNightMode, Data::new());
    assert!(acknowledge(&apply.done()).is_none());
    assert!(acknowledge(&Frame::request(Syscall::GetSettings, Data::new())).is_none());
}

#[test]
fn local_effective_uses_global_without_page() {
    let global = GlobalSettings { enabled: true, ..GlobalSettings::default() };
    assert!(local_effective(&global, None).enabled);
    assert!(local_effective(&global, Some("  ")).enabled);
}

#[test]
fn local_effective_resolves_site_lists() {
    let global = GlobalSettings {
        enabled: false,
        blacklisted_sites: ["a.com".to_owned()].into(),
        ..GlobalSettings::default()
    };
    assert!(local_effective(&global, Some("https://a.com/page")).enabled);
    assert!(!local_effective(&global, Some("https://b.com/")).enabled);
}

#[test]
fn parse_object_requires_json_object() {
    assert!(parse_object(r#"{"dark":true}"#).expect("object").contains_key("dark"));
    assert!(matches!(parse_object("[1]"), Err(CliError::MissingField(_))));
    assert!(matches!(parse_object("{"), Err(CliError::InvalidJson(_))));
}
