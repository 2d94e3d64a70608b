//! Application layer use cases for knitdisk.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure pattern rules in `knit_core`) and the infrastructure (serial ports,
//! files, configuration).
//!
//! Use cases in this layer:
//!
//! - **Orchestrate** domain objects to fulfil a user goal (e.g., "turn this
//!   photo into slot 901 and let the machine load it").
//! - **Depend on abstractions** (traits such as `DeviceOpener`) where the
//!   infrastructure must be swappable in tests.
//!
//! # Sub-modules
//!
//! - **`convert_image`**       – Resamples an image into a stitch grid and
//!   writes it as a pattern file.
//!
//! - **`emulate_disk`**        – The floppy-drive state machine that answers
//!   the knitting machine's requests over a byte stream.
//!
//! - **`orchestrate_session`** – Runs conversion and emulator start-up as one
//!   session per serial device and owns its lifecycle.

pub mod convert_image;
pub mod emulate_disk;
pub mod orchestrate_session;
