//! Decode-style pipeline on the soft device: a pool of NV12 surfaces mapped
//! to USM through DMA export, then read back on the CPU.
//!
//! ```text
//! RUST_LOG=debug cargo run -p prism-backends --example zero_copy_chain
//! ```

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::info;

use prism_backends::vaapi::VaapiFrameAllocator;
use prism_backends::{SoftDevice, SoftDeviceConfig, VaapiContext, derive_context};
use prism_core::pool::FramePool;
use prism_core::{AccessMode, ImageFormat, MapperOptions, MemoryType, create_mapper};

const WIDTH: usize = 1280;
const HEIGHT: usize = 720;
const POOL_SIZE: usize = 4;
const FRAMES: usize = 16;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();

    let config = match std::env::args().nth(1) {
        Some(path) => SoftDeviceConfig::from_json_file(path.as_ref())
            .with_context(|| format!("loading device config from {path}"))?,
        None => SoftDeviceConfig::default(),
    };
    let device = SoftDevice::new(config)?;

    let va = VaapiContext::create(&device);
    let dma = derive_context(&va, MemoryType::Dma)?;
    let usm = derive_context(&dma, MemoryType::LevelZero)?;
    let cpu = derive_context(&usm, MemoryType::Cpu)?;

    let pool = FramePool::new(
        &VaapiFrameAllocator::new(&va, WIDTH, HEIGHT),
        &[ImageFormat::Nv12, ImageFormat::Bgrx],
        POOL_SIZE,
    )?;
    let to_usm = create_mapper(
        &[Arc::clone(&va), dma, Arc::clone(&usm)],
        &MapperOptions::cached(),
    )?;
    let to_cpu = create_mapper(&[usm, cpu], &MapperOptions::default())?;
    info!(to_usm = to_usm.name(), to_cpu = to_cpu.name(), "Mappers resolved");

    let mut checksum = 0u64;
    for index in 0..FRAMES {
        let surface = pool.acquire().context("surface pool")?;
        let usm_frame = to_usm.map_frame(&surface, AccessMode::Read)?;
        let host = to_cpu.map_frame(&usm_frame, AccessMode::Read)?;
        let luma = host.tensor(0)?.read_bytes()?;
        checksum = checksum.wrapping_add(luma.iter().map(|&b| u64::from(b)).sum::<u64>());
        info!(index, planes = host.num_tensors(), "Frame mapped");
    }

    info!(checksum, "Done");
    device.report();
    Ok(())
}
