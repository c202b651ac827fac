//! Demux engine for an SoC transport-stream front-end.
//!
//! The hardware block filters MPEG-2 TS packets by PID and deposits the
//! survivors into a DMA ring in host memory; this crate owns everything
//! above the registers: the PID filter table, the ring drain, packet
//! and section parsing, and the feed lifecycle that routes data to
//! consumers.
//!
//! The entry point is [`device::DemuxDevice`], constructed over a
//! [`regs::RegisterPort`]. Real deployments supply an MMIO-backed port;
//! tests and host-side simulation use [`regs::ShadowRegisters`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use tsdmx::device::{DemuxDevice, TsConfig};
//! use tsdmx::feed::{DeliveryMeta, FeedKind};
//! use tsdmx::regs::ShadowRegisters;
//!
//! # fn main() -> tsdmx::error::Result<()> {
//! let port = Arc::new(ShadowRegisters::new());
//! let dev = DemuxDevice::new(port, TsConfig::default());
//! dev.init()?;
//! dev.start()?;
//! let feed = dev.start_feed(
//!     0x0100,
//!     FeedKind::RawTs,
//!     Box::new(|pk: &[u8], _: &DeliveryMeta| println!("{} bytes", pk.len())),
//!     None,
//! )?;
//! // ... bytes arrive via DMA, handle_interrupt dispatches them ...
//! dev.stop_feed(feed)?;
//! # Ok(())
//! # }
//! ```

pub mod device;
pub(crate) mod demux;
pub mod dma;
pub mod error;
pub mod feed;
pub mod filter;
pub mod packet;
pub mod pcr;
pub mod regs;
pub mod section;

pub use device::{DemuxDevice, TsConfig, TsMode};
pub use error::{DemuxError, Result};
pub use feed::{DeliveryMeta, FeedHandle, FeedKind, FeedSink, FeedState};
pub use section::SectionFilter;
