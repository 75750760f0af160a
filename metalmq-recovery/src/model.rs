/// AMQP channel number
pub type ChannelNumber = u16;
/// AMQP class id method id number
pub type ClassMethod = u32;

pub const CONNECTION_OPEN: ClassMethod = 0x000A_0028;
pub const CONNECTION_CLOSE: ClassMethod = 0x000A_0032;
pub const CHANNEL_OPEN: ClassMethod = 0x0014_000A;
pub const CHANNEL_CLOSE: ClassMethod = 0x0014_0028;
pub const EXCHANGE_DECLARE: ClassMethod = 0x0028_000A;
pub const EXCHANGE_DELETE: ClassMethod = 0x0028_0014;
pub const EXCHANGE_BIND: ClassMethod = 0x0028_001E;
pub const EXCHANGE_UNBIND: ClassMethod = 0x0028_0028;
pub const QUEUE_DECLARE: ClassMethod = 0x0032_000A;
pub const QUEUE_BIND: ClassMethod = 0x0032_0014;
pub const QUEUE_DELETE: ClassMethod = 0x0032_0028;
pub const QUEUE_UNBIND: ClassMethod = 0x0032_0032;
pub const BASIC_QOS: ClassMethod = 0x003C_000A;
pub const BASIC_CONSUME: ClassMethod = 0x003C_0014;
pub const BASIC_CANCEL: ClassMethod = 0x003C_001E;
pub const BASIC_PUBLISH: ClassMethod = 0x003C_0028;
pub const BASIC_ACK: ClassMethod = 0x003C_0050;
pub const CONFIRM_SELECT: ClassMethod = 0x0055_000A;
pub const TX_SELECT: ClassMethod = 0x005A_000A;

/// Error codes in connection scope.
#[derive(Debug)]
pub enum ConnectionError {
    /// The server forced to close the connection.
    ConnectionForced = 320,
    /// The client tried to work with an invalid virtual host.
    InvalidPath = 402,
    /// The client tried to access a resource it didn't have access.
    AccessRefused = 403,
    /// The client sent an invalid AMQP frame.
    FrameError = 501,
    /// The client sent a frame which contains erroneous data.
    SyntaxError = 502,
    /// The client sent a frame which didn't fit in the normal order.
    CommandInvalid = 503,
    /// The client tried to access a non-existing or not-opened channel.
    ChannelError = 504,
    /// The client sent an unexpected content header or body frame.
    UnexpectedFrame = 505,
    /// The client tried to exceed the limits of the connection agreed during connection tune.
    ResourceError = 506,
    /// The client tried to work with an entity in a way which is not allowed by the server.
    NotAllowed = 530,
    /// The client tried to use a not implemented funcionality.
    NotImplemented = 540,
    /// The server couldn't fulfill the request because of an intermittent error.
    InternalError = 541,
}

/// Error codes in channel scope.
#[derive(Debug)]
pub enum ChannelError {
    /// Denotes successful execution like connection or channel closed.
    Success = 200,
    /// The client tried to access a resource it didn't have access.
    AccessRefused = 403,
    /// Queue or entity cannot be found.
    NotFound = 404,
    /// The client cannot access a resource because another client is working on what.
    ResourceLocked = 405,
    /// The work on resource is refused mostly because of validation errors.
    PreconditionFailed = 406,
}

/// Conditions raised by the client itself, they never travel on the wire.
#[derive(Debug)]
pub enum LocalError {
    /// The transport lost the connection to the server.
    ConnectionLost = 1,
    /// The server didn't answer in time.
    Timeout = 2,
    /// The operation was refused because the connection is recovering.
    Recovering = 3,
    /// Too many operations are already waiting for the recovery to finish.
    QueueFull = 4,
    /// Automatic recovery gave up, the connection won't come back.
    RecoveryFailed = 5,
    /// The connection or the channel was closed by the application.
    Closed = 6,
    /// The server speaks a different protocol version.
    ProtocolMismatch = 7,
}
