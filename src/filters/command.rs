use async_trait::async_trait;

use crate::mail_reader::error::MailError;
use crate::mail_reader::session::{Command, Connector, Flag, SessionHandle};
use crate::mail_reader::Uid;

/// What a filter may do to the message it was handed. Nothing else of the
/// session (reconnect, select, fetch) is reachable from here.
#[async_trait]
pub trait CommandInterface: Send {
    async fn move_to(&mut self, folder: &str) -> Result<(), MailError>;

    async fn delete(&mut self) -> Result<(), MailError>;

    async fn set_flag(&mut self, flag: Flag, on: bool) -> Result<(), MailError>;
}

/// [`CommandInterface`] bound to one message of the live session.
pub struct SessionCommands<'a, C: Connector> {
    session: &'a mut SessionHandle<C>,
    uid: Uid,
    issued: Vec<Command>,
}

impl<'a, C: Connector> SessionCommands<'a, C> {
    pub fn new(session: &'a mut SessionHandle<C>, uid: Uid) -> Self {
        Self {
            session,
            uid,
            issued: Vec::new(),
        }
    }

    /// Commands the server accepted, in order.
    pub fn issued(&self) -> &[Command] {
        &self.issued
    }

    async fn issue(&mut self, command: Command) -> Result<(), MailError> {
        self.session.issue_command(self.uid, &command).await?;
        self.issued.push(command);
        Ok(())
    }
}

#[async_trait]
impl<'a, C: Connector> CommandInterface for SessionCommands<'a, C> {
    async fn move_to(&mut self, folder: &str) -> Result<(), MailError> {
        self.issue(Command::Move(folder.to_string())).await
    }

    async fn delete(&mut self) -> Result<(), MailError> {
        self.issue(Command::Delete).await
    }

    async fn set_flag(&mut self, flag: Flag, on: bool) -> Result<(), MailError> {
        self.issue(Command::SetFlag { flag, on }).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{credentials, mail, FakeServer};

    #[tokio::test]
    async fn commands_go_to_the_bound_message() {
        let server = FakeServer::new("pw");
        server.add_message(3, mail("a@example.com", "s", "b"));
        server.add_message(4, mail("a@example.com", "s", "b"));
        let mut session = SessionHandle::new(server.connector(), Arc::new(credentials("pw")), "INBOX");
        session.reconnect().await.unwrap();

        let mut commands = SessionCommands::new(&mut session, 4);
        commands.set_flag(Flag::Flagged, true).await.unwrap();
        commands.move_to("Archive").await.unwrap();
        assert_eq!(commands.issued().len(), 2);

        assert!(server.contains(3));
        assert!(!server.contains(4));
        assert_eq!(
            server.commands(),
            vec![
                (4, Command::SetFlag { flag: Flag::Flagged, on: true }),
                (4, Command::Move("Archive".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn rejected_command_keeps_the_session_selected() {
        let server = FakeServer::new("pw");
        server.add_message(3, mail("a@example.com", "s", "b"));
        server.reject_commands();
        let mut session = SessionHandle::new(server.connector(), Arc::new(credentials("pw")), "INBOX");
        session.reconnect().await.unwrap();

        let err = SessionCommands::new(&mut session, 3).move_to("Nope").await.unwrap_err();
        assert!(matches!(err, MailError::Command { uid: 3, .. }));
        assert!(session.is_selected());
    }
}
