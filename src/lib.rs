//! Coverage-guided fuzzing harness with a strict orchestrator/worker split.
//!
//! The manager process owns the scheduling loop, corpus bookkeeping and
//! resource governance; the worker process executes the target callable and
//! reports a coverage signal after every run. The two sides talk over a
//! strictly alternating request/response protocol on a pair of pipes, so a
//! crash, hang or OOM in the target can never corrupt the manager's state.

pub mod artifact;
pub mod config;
pub mod corpus;
pub mod grammar;
pub mod manager;
pub mod protocol;
pub mod runner;
pub mod targets;
