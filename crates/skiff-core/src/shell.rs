//! Secondary shell-mode session.
//!
//! Backends that cannot run arbitrary commands borrow a peer session whose
//! protocol is forced to "shell". The peer inherits connection parameters
//! and replays the parent's stored passwords exactly once per kind (main
//! versus tunnel) before falling back to normal prompting.

use std::sync::Arc;

use crate::error::{SessionError, SessionResult};
use crate::session::Protocol;
use crate::terminal::Terminal;
use crate::tunnel::PasswordReplay;

impl Terminal {
    /// The secondary shell session, created and opened on first use.
    pub fn command_session(&mut self) -> SessionResult<&mut Terminal> {
        if self.command_session.is_none() {
            let session = self.make_command_session()?;
            self.command_session = Some(Box::new(session));
        }
        let in_transaction = self.in_transaction();
        let session = self
            .command_session
            .as_mut()
            .expect("command session just created");
        if !session.is_active() {
            session.open()?;
            // Transactional grouping spans both sessions.
            if in_transaction {
                session.begin_transaction();
            }
        }
        Ok(session)
    }

    pub fn has_command_session(&self) -> bool {
        self.command_session.is_some()
    }

    fn make_command_session(&self) -> SessionResult<Terminal> {
        if self.session_data().protocol == Protocol::Shell {
            return Err(SessionError::command(
                "a shell session cannot spawn another shell session",
            ));
        }
        let mut data = self.session_data().clone();
        data.name = format!("{} (shell)", data.session_name());
        data.protocol = Protocol::Shell;
        data.remote_directory = None;
        data.tunnel = None;
        data.number_of_retries = 0;

        let password = data
            .password
            .as_ref()
            .map(|secret| self.configuration.decrypt_password(&secret.0));
        let tunnel_password = self
            .session_data()
            .tunnel
            .as_ref()
            .and_then(|tunnel| tunnel.password.as_ref())
            .map(|secret| self.configuration.decrypt_password(&secret.0));

        let mut session = Terminal::with_shared_events(
            data,
            std::rc::Rc::clone(&self.configuration),
            std::rc::Rc::clone(&self.factory),
            std::rc::Rc::clone(&self.events),
        );
        session.auto_read_directory = false;
        session.secondary = true;
        session.password_replay = Some(Arc::new(parking_lot::Mutex::new(PasswordReplay {
            main_tried: false,
            tunnel_tried: false,
            password,
            tunnel_password,
        })));
        Ok(session)
    }
}
