//! Concrete gate collaborators.
//!
//! Each type here implements [`engine::GateCollaborator`] for one way of
//! obtaining a gate outcome. The engine sees only the trait.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Process spawning, file reads, and output parsing live
//! here. No decision logic: a collaborator reports what the check observed
//! and the [`gates`] crate classifies it.
//!
//! | Collaborator | Source of the outcome |
//! |--------------|-----------------------|
//! | [`CommandCollaborator`] | An external program, run once per evaluation |
//! | [`EvidenceCollaborator`] | `<evidence>/<gate-id>.json` recorded by an earlier CI run |
//!
//! Both understand the same wire shape, [`gates::CheckOutcome`] in camelCase:
//!
//! ```json
//! {"passed": true, "testsRun": 41, "testsPassed": 41, "durationMs": 5120, "detail": "ok"}
//! ```

mod command;
mod evidence;

pub use command::CommandCollaborator;
pub use evidence::EvidenceCollaborator;
