//! Common types shared across the crate.

// ----------

pub(crate) use thiserror::Error as ImplError;
