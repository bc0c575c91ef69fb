//! Static disassembly and control-flow recovery for 16-bit x86 code.
//!
//! Scatha loads MZ executables and OMF object libraries into a common
//! segmented [`Image`] model, then discovers code from a set of entry points:
//! instruction boundaries, basic blocks, cross references, a block-level
//! control-flow graph and procedures. Relocations and OMF fixups are matched
//! against operand encodings so that operands refer to symbols instead of
//! raw numbers.
//!
//! ```no_run
//! use scatha::{analyze, AnalysisConfig, IcedDecoder, Session};
//!
//! let mut loaded = scatha::open("GAME.EXE")?;
//! let entries = loaded.default_entry_points();
//! let mut session = Session::new();
//! analyze(
//!     loaded.image_mut(),
//!     &IcedDecoder::new(),
//!     &mut session,
//!     &entries,
//!     &AnalysisConfig::default(),
//! );
//! for procedure in session.procedures().iter() {
//!     println!("{}", procedure.display_name());
//! }
//! # Ok::<(), scatha::ScathaError>(())
//! ```

pub mod analysis;
pub mod config;
pub mod core;
pub mod disasm;
pub mod error;
pub mod formats;
pub mod image;
pub mod logging;

pub use analysis::{analyze, EntryPoint, Session};
pub use config::AnalysisConfig;
pub use disasm::iced::IcedDecoder;
pub use disasm::Decoder;
pub use error::{Result, ScathaError};
pub use formats::{load, open, LoadedImage};
pub use image::Image;
