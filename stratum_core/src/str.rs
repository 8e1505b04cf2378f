//! Some string type helpers.
//!
//! Moved into a separate module, so we could experiment with different representations.

use std::sync::Arc;

/// `Str` is a string that can be cloned cheaply.
pub type Str = Arc<str>;
