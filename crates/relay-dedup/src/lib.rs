pub mod extract;
pub mod guard;
pub mod intake;

pub use extract::{compile_rules, extract, CompiledRule, Extraction};
pub use guard::{DedupGuard, DedupVerdict, PendingIdentifier};
pub use intake::{
    extract_sender_address, InboundMessage, IntakeOutcome, IntakePipeline, IntakePolicy,
};
