//! Owning container of live sessions.

use crate::terminal::Terminal;

#[derive(Default)]
pub struct TerminalList {
    terminals: Vec<Terminal>,
}

impl TerminalList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a session; returns its index.
    pub fn add(&mut self, terminal: Terminal) -> usize {
        self.terminals.push(terminal);
        self.terminals.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&Terminal> {
        self.terminals.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Terminal> {
        self.terminals.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.terminals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terminals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Terminal> {
        self.terminals.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Terminal> {
        self.terminals.iter_mut()
    }

    /// Detach a session, handing ownership back to the caller.
    pub fn free(&mut self, index: usize) -> Terminal {
        self.terminals.remove(index)
    }

    pub fn active_count(&self) -> usize {
        self.terminals.iter().filter(|t| t.is_active()).count()
    }

    /// Pump keepalives across every open session.
    pub fn idle(&mut self) {
        for terminal in &mut self.terminals {
            if terminal.is_active() {
                if let Err(err) = terminal.idle() {
                    terminal.log().error(format!("Error in keepalive: {err}"));
                }
            }
        }
    }

    /// Re-seal stored session and tunnel passwords after a master-key
    /// change.
    pub fn recrypt_passwords(&mut self, recode: &dyn Fn(&str) -> String) {
        for terminal in &mut self.terminals {
            terminal.recrypt_passwords(recode);
        }
    }
}
