use std::fmt;
use std::io;
use std::thread::JoinHandle;

/// A message interface for [services](Service).
///
/// Most commonly, this interface is an enumeration of messages, but it can also be implemented on a
/// single message. For each individual message, this type needs to implement the [`FromMessage`]
/// trait.
///
/// # Implementating Interfaces
///
/// There are three main ways to implement interfaces, which depends on the number of messages and
/// their return values. The simplest way is an interface consisting of a **single message** with
/// **no return value**. For this case, use the message directly as interface and choose
/// `NoResponse` as response:
///
/// ```
/// use statsbuf_system::{FromMessage, Interface, NoResponse};
///
/// #[derive(Debug)]
/// pub struct SomeMessage;
///
/// impl Interface for SomeMessage {}
///
/// impl FromMessage<Self> for SomeMessage {
///     type Response = NoResponse;
///
///     fn from_message(message: Self, _: ()) -> Self {
///         message
///     }
/// }
/// ```
///
/// If there is a single message with a return value, implement the interface as a wrapper for
/// the message and the return [`Sender`]:
///
/// ```
/// use statsbuf_system::{BlockingResponse, FromMessage, Interface, Sender};
///
/// #[derive(Debug)]
/// pub struct GetFlag;
///
/// #[derive(Debug)]
/// pub struct GetFlagWithSender(GetFlag, Sender<bool>);
///
/// impl Interface for GetFlagWithSender {}
///
/// impl FromMessage<GetFlag> for GetFlagWithSender {
///     type Response = BlockingResponse<bool>;
///
///     fn from_message(message: GetFlag, sender: Sender<bool>) -> Self {
///         Self(message, sender)
///     }
/// }
/// ```
///
/// Finally, interfaces can be a collection of messages. This is the common case for services with
/// a real inbox, such as the event collector.
pub trait Interface: Send + 'static {}

/// Services without messages can use `()` as their interface.
impl Interface for () {}

/// An error when [sending](Addr::send) a message to a service fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("failed to send message to service")]
pub struct SendError;

/// An error when [trying to send](Addr::try_send) a message to a service fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TrySendError {
    /// The inbox of the service is at capacity.
    #[error("service inbox is full")]
    Full,
    /// The service has shut down and its inbox is gone.
    #[error("failed to send message to service")]
    Disconnected,
}

impl From<SendError> for TrySendError {
    fn from(_: SendError) -> Self {
        Self::Disconnected
    }
}

/// Response behavior of an [`Interface`] message.
///
/// It defines how a service handles and responds to interface messages, such as through
/// [`NoResponse`] or [`BlockingResponse`].
pub trait MessageResponse {
    /// Sends responses from the service back to the waiting recipient.
    type Sender;

    /// The type returned from [`Addr::send`].
    type Output;

    /// Returns the response channel for an interface message.
    fn channel() -> (Self::Sender, Self::Output);
}

/// The request when sending a [`BlockingResponse`] message.
///
/// The service responds on a dedicated single-slot channel. Waiting on the request blocks the
/// calling thread until the service has handled the message.
#[must_use = "requests do nothing unless waited on"]
pub struct Request<T>(crossbeam_channel::Receiver<T>);

impl<T> Request<T> {
    /// Blocks until the service responds.
    ///
    /// Returns `Err(SendError)` if the service dropped the sender without responding, which
    /// happens when the service shuts down or panics while handling the message.
    pub fn wait(self) -> Result<T, SendError> {
        self.0.recv().map_err(|_| SendError)
    }
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").finish_non_exhaustive()
    }
}

/// Sends a message response from a service back to the waiting [`Request`].
///
/// The sender is part of a [`BlockingResponse`] and should be moved into the service interface
/// type. If this sender is dropped without calling [`send`](Self::send), the request fails with
/// [`SendError`].
pub struct Sender<T>(crossbeam_channel::Sender<T>);

impl<T> Sender<T> {
    /// Sends the response value and closes the [`Request`].
    ///
    /// This silently drops the value if the requester has gone away.
    pub fn send(self, value: T) {
        self.0.send(value).ok();
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").finish_non_exhaustive()
    }
}

/// Message response resulting in a blocking [`Request`].
///
/// The sender must be placed on the interface in [`FromMessage::from_message`].
pub struct BlockingResponse<T>(std::marker::PhantomData<T>);

impl<T> fmt::Debug for BlockingResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlockingResponse")
    }
}

impl<T> MessageResponse for BlockingResponse<T> {
    type Sender = Sender<T>;
    type Output = Request<T>;

    fn channel() -> (Self::Sender, Self::Output) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (Sender(tx), Request(rx))
    }
}

/// Message response for fire-and-forget messages.
///
/// Use this type if a message does not have a return value.
pub struct NoResponse;

impl fmt::Debug for NoResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoResponse")
    }
}

impl MessageResponse for NoResponse {
    type Sender = ();
    type Output = ();

    fn channel() -> (Self::Sender, Self::Output) {
        ((), ())
    }
}

/// Declares a message as part of an [`Interface`].
///
/// Messages have an associated `Response` type that determines the return value of sending the
/// message. Within an interface, the responder can vary for each message.
pub trait FromMessage<M>: Interface {
    /// The behavior declaring the return value when sending this message.
    type Response: MessageResponse;

    /// Converts the message into the service interface.
    fn from_message(message: M, sender: <Self::Response as MessageResponse>::Sender) -> Self;
}

/// The address of a [`Service`].
///
/// Addresses allow to [send](Self::send) messages to a service that implements a corresponding
/// [`Interface`] as long as the service is running.
///
/// Addresses can be freely cloned. When the last clone is dropped, the message channel of the
/// service closes permanently, which signals to the service that it can shut down.
pub struct Addr<I: Interface> {
    tx: crossbeam_channel::Sender<I>,
}

impl<I: Interface> Addr<I> {
    /// Sends a message to the service and returns the response.
    ///
    /// If the inbox is at capacity, this blocks the calling thread until the service makes room.
    /// Fails with `Err(SendError)` if the service has shut down.
    pub fn send<M>(&self, message: M) -> Result<<I::Response as MessageResponse>::Output, SendError>
    where
        I: FromMessage<M>,
    {
        let (tx, rx) = I::Response::channel();
        self.tx
            .send(I::from_message(message, tx))
            .map_err(|_| SendError)?;
        Ok(rx)
    }

    /// Sends a message to the service without blocking.
    ///
    /// Fails with [`TrySendError::Full`] if the inbox is at capacity, in which case the message is
    /// dropped.
    pub fn try_send<M>(
        &self,
        message: M,
    ) -> Result<<I::Response as MessageResponse>::Output, TrySendError>
    where
        I: FromMessage<M>,
    {
        let (tx, rx) = I::Response::channel();
        match self.tx.try_send(I::from_message(message, tx)) {
            Ok(()) => Ok(rx),
            Err(crossbeam_channel::TrySendError::Full(_)) => Err(TrySendError::Full),
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => Err(TrySendError::Disconnected),
        }
    }
}

impl<I: Interface> fmt::Debug for Addr<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("queue_size", &self.tx.len())
            .finish()
    }
}

// Manually derive `Clone` since we do not require `I: Clone` and the Clone derive adds this
// constraint.
impl<I: Interface> Clone for Addr<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Inbound channel for messages sent through an [`Addr`].
///
/// Services select over the [inner](Self::inner) channel next to their other event sources, such
/// as a flush ticker. The channel disconnects when all associated [`Addr`]s are dropped.
pub struct Receiver<I: Interface> {
    rx: crossbeam_channel::Receiver<I>,
}

impl<I: Interface> Receiver<I> {
    /// Returns the underlying channel for use in [`select!`](crossbeam_channel::select).
    pub fn inner(&self) -> &crossbeam_channel::Receiver<I> {
        &self.rx
    }
}

impl<I: Interface> fmt::Debug for Receiver<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("queue_size", &self.rx.len())
            .finish()
    }
}

/// Creates a bounded channel for communicating with a [`Service`].
///
/// Senders block once `capacity` messages are waiting. The capacity is at least `1`.
pub fn channel<I: Interface>(capacity: usize) -> (Addr<I>, Receiver<I>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (Addr { tx }, Receiver { rx })
}

/// An asynchronous unit responding to messages.
///
/// Services receive messages conforming to some [`Interface`] through an [`Addr`] and handle them
/// one by one on a dedicated thread. Internally, services are free to run background work such
/// as a flush ticker next to the inbox.
///
/// Services must be started with [`Service::start`], which returns the service's address and
/// the handle of its thread.
pub trait Service: Sized + Send + 'static {
    /// The interface of messages this service implements.
    type Interface: Interface;

    /// Spawns the thread handling messages from the inbox.
    ///
    /// The thread should exit once the receiver closes, which happens when all addresses have
    /// been dropped.
    fn spawn_handler(self, rx: Receiver<Self::Interface>) -> io::Result<JoinHandle<()>>;

    /// Starts the service with an inbox of the given capacity.
    fn start(self, capacity: usize) -> io::Result<(Addr<Self::Interface>, JoinHandle<()>)> {
        let (addr, rx) = channel(capacity);
        let handle = self.spawn_handler(rx)?;
        statsbuf_log::debug!(service = Self::name(), "service started");
        Ok((addr, handle))
    }

    /// Returns a unique name for this service implementation.
    ///
    /// This is used for internal diagnostics and uses the fully qualified type name of the service
    /// implementor by default.
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}
