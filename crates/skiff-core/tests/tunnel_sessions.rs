mod common;

use std::rc::Rc;
use std::time::Duration;

use skiff_core::backend::SecureFlavor;
use skiff_core::config::Configuration;
use skiff_core::events::TerminalEvents;
use skiff_core::session::{SessionData, TunnelOptions};
use skiff_core::terminal::TerminalStatus;

use common::{make_terminal_with_config, new_state};

fn tunneled_session_data() -> SessionData {
    let mut data = SessionData::parse_url("sftp://deploy@real.example.com:2022").unwrap();
    data.tunnel = Some(TunnelOptions {
        host: "bastion.example.com".to_string(),
        port: 22,
        user: "jump".to_string(),
        ..TunnelOptions::default()
    });
    data
}

fn no_auto_reopen() -> Rc<Configuration> {
    let mut configuration = Configuration::default();
    configuration.session_reopen_auto = Duration::ZERO;
    Rc::new(configuration)
}

#[test]
fn tunnel_bring_up_rewrites_and_restores_the_descriptor() {
    let state = new_state();
    let (mut terminal, factory) = make_terminal_with_config(
        &state,
        tunneled_session_data(),
        Rc::new(Configuration::default()),
        TerminalEvents::default(),
    );
    factory.tunnel_error.replace(Some("forward ended".to_string()));

    terminal.open().unwrap();
    assert_eq!(terminal.status(), TerminalStatus::Opened);

    let local_port = terminal.tunnel_local_port();
    assert!((50_000..=50_099).contains(&local_port));

    let transports = factory.transports.borrow();
    assert_eq!(transports.len(), 2);
    // First the tunnel hop with the forward directive...
    assert_eq!(transports[0].host, "bastion.example.com");
    assert_eq!(
        transports[0].port_fwd.as_deref(),
        Some(format!("L{local_port}\treal.example.com:2022").as_str())
    );
    // ...then the real session against the local forward.
    assert_eq!(transports[1].host, "127.0.0.1");
    assert_eq!(transports[1].port, local_port);
    assert!(transports[1].port_fwd.is_none());
    drop(transports);

    // The descriptor shows the real endpoint again once open finished.
    assert_eq!(terminal.session_data().host, "real.example.com");
    assert_eq!(terminal.session_data().port, 2022);

    terminal.close();
    assert_eq!(terminal.status(), TerminalStatus::Closed);
    assert_eq!(terminal.tunnel_local_port(), 0);
    assert_eq!(terminal.last_tunnel_error(), Some("forward ended"));
}

#[test]
fn tunnel_local_port_override_is_used_verbatim() {
    let state = new_state();
    let mut data = tunneled_session_data();
    data.tunnel.as_mut().unwrap().local_port = 50_123;
    let (mut terminal, factory) = make_terminal_with_config(
        &state,
        data,
        Rc::new(Configuration::default()),
        TerminalEvents::default(),
    );

    terminal.open().unwrap();
    assert_eq!(terminal.tunnel_local_port(), 50_123);
    assert_eq!(
        factory.transports.borrow()[0].port_fwd.as_deref(),
        Some("L50123\treal.example.com:2022")
    );
    terminal.close();
}

#[test]
fn main_transport_failure_surfaces_the_tunnel_error() {
    let state = new_state();
    let (mut terminal, factory) = make_terminal_with_config(
        &state,
        tunneled_session_data(),
        no_auto_reopen(),
        TerminalEvents::default(),
    );
    factory.fail_main_transport_open.set(true);
    factory
        .tunnel_error
        .replace(Some("bastion dropped the forward".to_string()));

    let err = terminal.open().unwrap_err();
    assert!(err.is_fatal());
    assert!(
        err.to_string().contains("bastion dropped the forward"),
        "unexpected error: {err}"
    );
    assert_eq!(terminal.status(), TerminalStatus::Closed);
    assert_eq!(terminal.tunnel_local_port(), 0);
}

#[test]
fn tunnel_open_failure_tears_the_stack_down() {
    let state = new_state();
    let (mut terminal, factory) = make_terminal_with_config(
        &state,
        tunneled_session_data(),
        no_auto_reopen(),
        TerminalEvents::default(),
    );
    factory.fail_tunnel_transport_open.set(true);

    let err = terminal.open().unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(terminal.status(), TerminalStatus::Closed);
    assert_eq!(terminal.tunnel_local_port(), 0);
    // Only the tunnel transport was ever constructed.
    assert_eq!(factory.transports.borrow().len(), 1);
}

#[test]
fn sftp_fallback_selects_the_scp_flavor() {
    let state = new_state();
    let mut data = SessionData::parse_url("sftp://deploy@real.example.com").unwrap();
    data.cache_directory_changes = false;
    let (mut terminal, factory) = make_terminal_with_config(
        &state,
        data,
        Rc::new(Configuration::default()),
        TerminalEvents::default(),
    );
    factory.sftp_fallback.set(true);

    terminal.open().unwrap();
    assert_eq!(factory.secure_flavors.borrow().as_slice(), &[SecureFlavor::Scp]);
    terminal.close();
}
