//! Terminal output for the CLI
//!
//! Status lines, prompts and fetch progress all go to stderr, leaving stdout
//! to the sandboxed command and to machine-readable listings. In CI or when
//! stderr is not a terminal everything degrades to plain lines.
//!
//! # Example
//!
//! ```rust,ignore
//! use run_isolated::ui::{self, UiContext};
//!
//! let ctx = UiContext::detect().with_auto_yes(args.yes);
//! if ui::confirm(&ctx, "Remove every cache entry?", false).await? {
//!     let removed = cache.clear().await?;
//!     ui::step_ok(&ctx, &format!("Removed {} entries", removed));
//! }
//! ```

mod context;
mod output;
mod progress;
mod prompts;

pub use context::UiContext;
pub use output::{format_bytes, key_value, section, step_info, step_ok, step_warn};
pub use progress::FetchProgress;
pub use prompts::confirm;
