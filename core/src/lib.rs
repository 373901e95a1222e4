pub mod artifacts;
pub mod cache;
pub mod checker;
pub mod code;
pub mod config;
pub mod context;
pub mod digest;
pub mod environment;
pub mod generators;
pub mod outcome;
pub mod package;
pub mod sandbox;
pub mod serdable;
pub mod solutions;
pub mod steps;
pub mod storage;
pub mod str_interp;
pub mod testing;
pub mod validators;

pub use crate::config::Config;
pub use crate::context::BuildContext;
pub use crate::outcome::Outcome;

pub mod error {
    #[allow(unused_imports)]
    pub(crate) use anyhow::{anyhow, bail, ensure, Context as _};
    pub use anyhow::{Error, Result};
}
