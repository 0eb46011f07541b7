use projection_ui_sync_runtime::{Socket, TransportError};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// What the transport asked the driver loop to do with the real socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    Open(String),
    Send(String),
    Close,
}

/// [`Socket`] that hands every request to the async driver loop. The loop
/// owns the WebSocket and reports back through the session's `handle_*`
/// methods.
pub struct ChannelSocket {
    commands: UnboundedSender<SocketCommand>,
}

impl ChannelSocket {
    pub fn new() -> (Self, UnboundedReceiver<SocketCommand>) {
        let (commands, receiver) = unbounded_channel();
        (Self { commands }, receiver)
    }

    fn push(&self, command: SocketCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::Socket("socket driver stopped".to_string()))
    }
}

impl Socket for ChannelSocket {
    fn open(&mut self, url: &str) -> Result<(), TransportError> {
        self.push(SocketCommand::Open(url.to_string()))
    }

    fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        self.push(SocketCommand::Send(frame.to_string()))
    }

    fn close(&mut self) {
        // The loop may already be gone during shutdown.
        let _ = self.push(SocketCommand::Close);
    }
}
