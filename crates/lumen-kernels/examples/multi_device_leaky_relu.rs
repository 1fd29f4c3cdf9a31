//! Apply LeakyReLU to a batch split across two devices.
//!
//! Each device holds its partition as pitched rows and is driven from its own
//! thread through its own `DeviceContext`. Uses host-emulated devices unless
//! `LUMEN_BACKEND=cuda` is set (and the `cuda` feature is enabled).
//!
//! ```text
//! RUST_LOG=debug cargo run -p lumen-kernels --example multi_device_leaky_relu
//! ```

use std::thread;

use lumen_common::EngineConfig;
use lumen_kernels::{Activation, DeviceRegistry, Result};

const WIDTH: usize = 6;
const PITCH: usize = 8;
const ROWS_PER_DEVICE: usize = 2;

fn main() -> Result<()> {
    env_logger::init();

    let mut config = EngineConfig::from_env()?;
    if config.host_devices < 2 {
        config.host_devices = 2;
    }
    let registry = DeviceRegistry::from_config(&config)?;
    let activation = Activation::leaky_relu();
    println!("{activation} over {} devices", registry.device_count());

    let batch: Vec<f32> = (0..2 * ROWS_PER_DEVICE * WIDTH).map(|i| i as f32 - 12.0).collect();

    let outputs = thread::scope(|scope| {
        let handles: Vec<_> = batch
            .chunks(ROWS_PER_DEVICE * WIDTH)
            .enumerate()
            .map(|(device, partition)| {
                let registry = &registry;
                scope.spawn(move || -> Result<Vec<f32>> {
                    let ctx = registry.bind(device)?;
                    let stream = ctx.create_stream()?;
                    let mut rows = stream.upload_pitched(partition, WIDTH, PITCH, f32::NAN)?;
                    activation.compute_multi_gpu(&ctx, &mut rows, WIDTH, ROWS_PER_DEVICE, &stream)?;
                    stream.synchronize()?;
                    stream.download(rows.buffer())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("device thread panicked")).collect::<Vec<_>>()
    });

    for (device, output) in outputs.into_iter().enumerate() {
        for row in output?.chunks(PITCH) {
            println!("device {device}: {:?}", &row[..WIDTH]);
        }
    }

    registry.shutdown();
    Ok(())
}
