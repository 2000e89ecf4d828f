//! shm-demo — replays the two-party calendar scenario against one segment.
//! Smoke test for the handle API: A creates and commits, B attaches and reads,
//! both release, and the name is gone afterwards.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::config::AppConfig;
use shm::{HandleState, SegmentOptions, SharedHandle, SharedValue, UniqueHandle};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CalendarMonth {
    month: i32,
    year: i32,
}

impl Default for CalendarMonth {
    fn default() -> Self {
        Self {
            month: 6,
            year: 2022,
        }
    }
}

// Two plain integers, repr(C).
unsafe impl SharedValue for CalendarMonth {}

fn main() -> Result<()> {
    let config_path = std::env::args().nth(1);
    let config = AppConfig::load_or_default(config_path.as_deref().map(Path::new))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level)),
        )
        .init();

    let opts = SegmentOptions::from(&config.segment);
    let name = config.demo.name.as_str();
    info!("Segment {} in {}", name, opts.dir.display());

    // Process A
    let mut a = SharedHandle::<CalendarMonth>::open_with(name, &opts)?;
    let initial = a.load()?.context("A: lock wait failed on first read")?;
    info!("A: opened, value = {:?}", initial);

    let committed = CalendarMonth {
        month: 6,
        year: 1997,
    };
    anyhow::ensure!(a.commit(&committed)?, "A: lock wait failed on commit");
    info!("A: committed {:?}", committed);

    // Process B
    let b = SharedHandle::<CalendarMonth>::open_with(name, &opts)?;
    let seen = b.load()?.context("B: lock wait failed on read")?;
    anyhow::ensure!(
        seen == committed,
        "B: read {:?}, expected {:?}",
        seen,
        committed
    );
    info!("B: attached, read {:?}, live handles = {}", seen, b.live_handles()?);

    // Copy, then move the copy out; the moved-from handle is left empty.
    let mut copy = b.try_clone()?;
    let moved = copy.take();
    anyhow::ensure!(copy.state() == HandleState::Empty, "moved-from handle not empty");
    info!(
        "copy moved: live handles = {}, moved-from state = {:?}",
        moved.live_handles()?,
        copy.state()
    );

    let unique = UniqueHandle::<CalendarMonth>::open_with(name, &opts)?;
    info!("unique handle attached: live handles = {}", unique.live_handles()?);
    drop(unique);
    drop(moved);

    a.release()?;
    info!(
        "A: released, live handles = {}, segment present = {}",
        b.live_handles()?,
        shm::mmap::shm_exists(&opts.dir, name)
    );

    drop(b);
    match SharedHandle::<CalendarMonth>::attach_with(name, &opts) {
        Err(e) if e.is_not_found() => info!("B: released, segment {} removed", name),
        Ok(other) => warn!(
            "segment {} still held elsewhere ({} live handles incl. this probe)",
            name,
            other.live_handles()?
        ),
        Err(e) => return Err(e).context("attach-only probe failed"),
    }

    Ok(())
}
