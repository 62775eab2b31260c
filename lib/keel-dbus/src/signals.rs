use async_trait::async_trait;
use futures::StreamExt as _;
use keel_core::bus::{BusError, SignalBus, SignalMatch, SignalMessage, SignalSubscription};
use tracing::debug;
use zbus::{message::Type as MessageType, Connection, MatchRule, Message, MessageStream};

/// Signal subscriptions over a D-Bus connection.
#[derive(Clone)]
pub struct DbusSignalBus {
    connection: Connection,
}

impl DbusSignalBus {
    /// Creates a new `DbusSignalBus` over the given connection.
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl SignalBus for DbusSignalBus {
    async fn subscribe(&self, signal: &SignalMatch) -> Result<Box<dyn SignalSubscription>, BusError> {
        let rule = signal.to_string();
        let subscribe_error = |e: zbus::Error| BusError::Subscribe {
            rule: rule.clone(),
            source: e.into(),
        };

        let match_rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .path(signal.path)
            .map_err(subscribe_error)?
            .interface(signal.interface)
            .map_err(subscribe_error)?
            .member(signal.member)
            .map_err(subscribe_error)?
            .build();

        // Registers the match with the bus daemon; dropping the stream removes it again.
        let stream = MessageStream::for_match_rule(match_rule, &self.connection, None)
            .await
            .map_err(subscribe_error)?;

        debug!(%rule, "Subscribed to signal.");
        Ok(Box::new(DbusSubscription { rule, stream }))
    }
}

struct DbusSubscription {
    rule: String,
    stream: MessageStream,
}

#[async_trait]
impl SignalSubscription for DbusSubscription {
    async fn next_signal(&mut self) -> Option<Result<SignalMessage, BusError>> {
        match self.stream.next().await? {
            Ok(message) => Some(Ok(decode_signal(&message))),
            Err(e) => Some(Err(BusError::Receive { source: e.into() })),
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
        let Self { rule, stream } = *self;
        drop(stream);
        debug!(%rule, "Unsubscribed from signal.");
        Ok(())
    }
}

fn decode_signal(message: &Message) -> SignalMessage {
    let body = message.body();
    match body.deserialize::<bool>() {
        Ok(value) => SignalMessage::Bool(value),
        Err(_) => SignalMessage::Other {
            signature: body.signature().to_string(),
        },
    }
}
