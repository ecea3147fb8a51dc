//! ComfyUI REST client library.
//!
//! Provides the HTTP API wrapper (submission, history, image view and
//! upload), typed history records, input-image readiness checks, and the
//! history polling state machine used to wait for a submitted prompt.

pub mod api;
pub mod history;
pub mod inputs;
pub mod poll;
