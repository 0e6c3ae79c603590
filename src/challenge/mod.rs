//! Proof-of-storage challenges: records, validator tickets, the protocol that answers a
//! challenge, and the poller/processor pair that drives it.

pub mod entity;
pub mod persist;
pub mod protocol;
pub mod status_map;
pub mod timing;
pub mod validator;
pub mod worker;

pub use entity::{Challenge, ChallengeResult, ChallengeStatus, ValidationTicket};
pub use persist::{PersistJob, PersistQueue};
pub use protocol::{commit_challenge, load_validation_tickets, select_block, select_block_offset, tally, Tally};
pub use status_map::ChallengeStatusMap;
pub use timing::ChallengeTiming;
pub use validator::{ChallengeRequest, HttpValidatorClient, ValidatorClient, WriteMarkerWithKey};
pub use worker::{poll_challenges, poll_once, process_challenge, process_challenges, requeue_open};
