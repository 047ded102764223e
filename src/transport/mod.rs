pub mod channel;
pub mod handshake;
pub mod protocol;
pub mod session;

pub use channel::{
    ChannelConnector, ChannelFrame, ChannelInbound, ChannelIo, MemoryConnector, MemoryListener,
    MemoryPeer, WsConnector,
};
pub use handshake::{HttpSessionApi, SessionApi, SessionInfo};
pub use protocol::{is_normal_closure, ClientMessage, MessageKind, ServerMessage, TransportEvent};
pub use session::{
    ConnectOutcome, ConnectStart, ConnectTicket, ConnectionStatus, Session, SessionTransport,
    TransportEnvelope,
};
