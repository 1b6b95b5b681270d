//! Test fixtures

mod faulty;
mod session_pair;

pub use faulty::{Corruption, Fault, FaultyTransport};
pub use session_pair::{EVENT_TIMEOUT, Peer, SessionPair, init_tracing, wait_closed};
