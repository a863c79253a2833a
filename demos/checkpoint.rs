//! Example: checkpoint a 2D field in slabs, restart, and read a window back
//!
//! Run with: cargo run --example checkpoint

use esdm::{Accessibility, DataType, Dataspace, Esdm, EsdmConfig, FormatFlags};
use std::time::Instant;

const ROWS: u64 = 512;
const COLS: u64 = 1024;

fn config(root: &std::path::Path) -> Result<EsdmConfig, Box<dyn std::error::Error>> {
    let json = format!(
        r#"{{ "esdm": {{
            "backends": [
                {{ "type": "POSIX", "id": "scratch", "target": "{scratch}",
                   "max-fragment-size": 262144, "compression": "zstd",
                   "performance-model": {{ "latency-ms": 0.5, "throughput-mbps": 800.0 }} }},
                {{ "type": "POSIX", "id": "archive", "target": "{archive}",
                   "performance-model": {{ "latency-ms": 5.0, "throughput-mbps": 200.0 }} }}
            ],
            "metadata": {{ "type": "POSIX", "target": "{md}" }}
        }} }}"#,
        scratch = root.join("scratch").display(),
        archive = root.join("archive").display(),
        md = root.join("metadata").display(),
    );
    Ok(EsdmConfig::from_json_str(&json)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("ESDM Checkpoint Demo");
    println!("====================\n");

    let root = std::env::temp_dir().join(format!("esdm-checkpoint-{}", std::process::id()));
    let space = Dataspace::new(&[ROWS, COLS], DataType::F32)?;

    // Simulation: write the field in four row slabs, one per "rank"
    {
        let esdm = Esdm::init(config(&root)?).await?;
        esdm.mkfs(FormatFlags::PURGE_RECREATE, Accessibility::Global).await?;

        let container = esdm.container_create("simulation").await?;
        let field = container.dataset_create("temperature", space.clone()).await?;
        field.set_dim_names(["y", "x"])?;
        field.set_attribute("units", "K");

        let start = Instant::now();
        let slab_rows = ROWS / 4;
        for rank in 0..4 {
            let slab = space.subspace(&[slab_rows, COLS], &[(rank * slab_rows) as i64, 0])?;
            let values: Vec<f32> = (0..slab.element_count())
                .map(|i| 273.15 + (rank * slab_rows * COLS + i) as f32 * 1e-4)
                .collect();
            field.write_elements(&values, &slab)?;
        }
        let report = container.commit().await?;
        println!(
            "Committed {} fragments in {:.2?}",
            report.persisted.len(),
            start.elapsed()
        );
        println!("{}", field.stats().summary());

        let mut placements = std::collections::BTreeMap::new();
        for fragment in field.fragments() {
            *placements.entry(fragment.placement().to_string()).or_insert(0) += 1;
        }
        println!("Placement: {:?}\n", placements);
        esdm.finalize().await?;
    }

    // Restart: a fresh engine sees the committed checkpoint
    let esdm = Esdm::init(config(&root)?).await?;
    let container = esdm.container_open("simulation").await?;
    let field = container.dataset_open("temperature").await?;
    println!("Reopened {} with dims {:?}", field.key(), field.dim_names());

    let window = space.subspace(&[4, 6], &[126, 500])?;
    let start = Instant::now();
    let array = field.read_array::<f32>(&window).await?;
    println!("Read window {} in {:.2?}:", window, start.elapsed());
    for row in array.outer_iter() {
        let cells: Vec<String> = row.iter().map(|v| format!("{:.4}", v)).collect();
        println!("  {}", cells.join(" "));
    }

    let report = esdm.fsck().await?;
    println!("\nfsck: {} entries checked, clean = {}", report.checked, report.is_clean());

    esdm.finalize().await?;
    std::fs::remove_dir_all(&root)?;
    Ok(())
}
