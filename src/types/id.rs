//! Document identifiers and timestamps

use rand::rngs::OsRng;
use rand::RngCore;

/// The kind prefix of a document identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdKind {
    Conversation,
    Message,
}

impl IdKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            IdKind::Conversation => "convo",
            IdKind::Message => "msg",
        }
    }
}

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate an identifier of the form `<kind>:<millis>:<random>`.
///
/// The random part is four 32-bit words drawn from the operating system's
/// CSPRNG, written back to back in decimal.
pub fn generate_id(kind: IdKind) -> String {
    let mut rng = OsRng;
    let random: String = (0..4).map(|_| rng.next_u32().to_string()).collect();
    format!("{}:{}:{}", kind.prefix(), now_millis(), random)
}
