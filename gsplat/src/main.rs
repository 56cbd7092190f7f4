use clap::Parser;
use gsplat_lib::{decode_ply, rows_to_bytes, IngestEvent, PipelineConfig, SplatPipeline};
use std::error::Error;
use std::fs;
use std::process;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(
    name = "Gaussian Splat Pipeline",
    version = "1.0",
    about = "Packs a splat file into GPU texture buffers and depth-sorts it for a view"
)]
struct Cli {
    #[arg(
        short = 'i',
        long = "input",
        value_name = "INPUT",
        required = true,
        help = "Path to the input file (.ply or canonical 32-byte rows)."
    )]
    input: String,

    #[arg(
        short = 'v',
        long = "view",
        value_name = "X,Y,Z,W",
        default_value = "0,0,1,0",
        help = "View vector dotted with each splat's homogeneous center."
    )]
    view: String,

    #[arg(
        long = "hashed",
        default_value = "false",
        help = "Sort for hashed (order-independent) blending: keep all splats."
    )]
    hashed: bool,

    #[arg(
        short = 'c',
        long = "chunk-size",
        value_name = "ROWS",
        default_value = "25000",
        help = "Rows buffered before a packer flush."
    )]
    chunk_size: usize,

    #[arg(
        short = 'm',
        long = "max-texture-size",
        value_name = "TEXELS",
        default_value = "4096",
        help = "Maximum 2D texture dimension of the target device."
    )]
    max_texture_size: u32,

    #[arg(
        short = 't',
        long = "top",
        value_name = "N",
        default_value = "10",
        help = "Print the first N indices of the sorted order."
    )]
    top: usize,
}

fn parse_view(text: &str) -> Option<[f32; 4]> {
    let mut view = [0.0f32; 4];
    let mut parts = text.split(',');
    for slot in &mut view {
        *slot = parts.next()?.trim().parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(view)
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    env_logger::init();
    let cli = Cli::parse();

    let view = parse_view(&cli.view).unwrap_or_else(|| {
        eprintln!("Error: --view must be four comma-separated numbers.");
        process::exit(1);
    });

    let raw_data = fs::read(&cli.input).unwrap_or_else(|e| {
        eprintln!("Error reading input file {}: {}", cli.input, e);
        process::exit(1);
    });

    // PLY files are converted to canonical rows up front; anything else is
    // treated as the canonical binary stream.
    let start = Instant::now();
    let bytes = if raw_data.starts_with(b"ply\n") {
        let rows = decode_ply(&raw_data)?;
        println!(
            "Decoded PLY: {} splats in {} ms",
            rows.len(),
            start.elapsed().as_millis()
        );
        rows_to_bytes(&rows)
    } else {
        raw_data
    };

    println!(
        "Input: {} | View: ({}, {}, {}, {}) | Hashed: {}",
        cli.input, view[0], view[1], view[2], view[3], cli.hashed
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let config = PipelineConfig {
            chunk_size: cli.chunk_size,
            max_texture_size: cli.max_texture_size,
        };

        let ingest_start = Instant::now();
        let mut pipeline = SplatPipeline::new(Some(bytes.len() as u64), config)?;
        let mut flushes = 0u32;
        pipeline
            .ingest(&bytes[..], |event| {
                if let IngestEvent::Packed { .. } = event {
                    flushes += 1;
                }
            })
            .await?;
        println!(
            "Packed {} splats into a {}x{} texture ({} flushes) in {} ms",
            pipeline.store().loaded_vertex_count(),
            pipeline.store().texture_width(),
            pipeline.store().texture_height(),
            flushes,
            ingest_start.elapsed().as_millis()
        );

        let mut target = pipeline.connect();
        target.arm();

        let sort_start = Instant::now();
        pipeline.update(&mut target, view, cli.hashed)?;
        let indices = loop {
            if let Some(indices) = pipeline.poll(&mut target) {
                break indices;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        };
        println!(
            "Sorted {} visible splats in {} ms",
            indices.len(),
            sort_start.elapsed().as_millis()
        );

        let shown = cli.top.min(indices.len());
        if shown > 0 {
            println!("First {} draw indices: {:?}", shown, &indices[..shown]);
        }

        Ok::<(), Box<dyn Error + Send + Sync>>(())
    })?;

    println!("Total time: {} ms", start.elapsed().as_millis());
    Ok(())
}
