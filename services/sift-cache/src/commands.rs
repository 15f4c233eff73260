//! Subcommand implementations.

use crate::config::EngineConfig;
use anyhow::{anyhow, Context, Result};
use cache_store::{CacheStore, EntryView};
use pyramid::{DerivedPipeline, PyramidBuilder, Recipe};
use raster_ops::ReaderRegistry;
use sift_common::{is_nodata, SourceDescriptor, TileCoord};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const MIB: f64 = 1024.0 * 1024.0;

fn open_store(config: &EngineConfig) -> Result<Arc<CacheStore>> {
    CacheStore::open(config.cache.clone())
        .with_context(|| format!("opening cache at {}", config.cache.root.display()))
}

/// Where a source lives and how to read it.
#[derive(Debug, Clone)]
pub struct SourceArgs {
    pub path: PathBuf,
    pub format: Option<String>,
    pub band: Option<u32>,
}

fn describe(readers: &ReaderRegistry, source: &SourceArgs) -> Result<SourceDescriptor> {
    readers
        .descriptor(&source.path, source.format.as_deref(), source.band)
        .with_context(|| format!("describing {}", source.path.display()))
}

fn builder(config: &EngineConfig, store: Arc<CacheStore>) -> Result<PyramidBuilder> {
    Ok(PyramidBuilder::new(
        store,
        ReaderRegistry::with_builtins(),
        config.pyramid.clone(),
    )?)
}

// =============================================================================
// Maintenance
// =============================================================================

pub fn stats(config: &EngineConfig, json: bool, list_entries: bool) -> Result<()> {
    let store = open_store(config)?;
    let stats = store.stats();

    if json {
        let mut value = serde_json::to_value(&stats)?;
        if list_entries {
            value["entry_list"] = serde_json::to_value(store.entries())?;
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("root:         {}", config.cache.root.display());
    println!("entries:      {}", stats.entries);
    println!(
        "used:         {:.1} MiB of {:.1} MiB ({:.1}%)",
        stats.used_bytes as f64 / MIB,
        stats.quota_bytes as f64 / MIB,
        stats.utilization() * 100.0
    );
    println!("pinned:       {}", stats.pinned_entries);

    if list_entries {
        let mut entries = store.entries();
        entries.sort_by(|a, b| b.last_access.cmp(&a.last_access));
        for entry in entries {
            println!(
                "{}  {:>5}x{:<5} {:>8}  {:>10.2} MiB  {}  {}",
                entry.key.short(),
                entry.shape.rows,
                entry.shape.cols,
                entry.dtype.as_str(),
                entry.size_bytes as f64 / MIB,
                entry.last_access.to_rfc3339(),
                entry.label.as_deref().unwrap_or("-"),
            );
        }
    }
    Ok(())
}

pub fn evict(config: &EngineConfig, target_mb: Option<u64>) -> Result<()> {
    let store = open_store(config)?;
    let target = target_mb
        .map(|mb| mb * 1024 * 1024)
        .unwrap_or(config.cache.quota_bytes);

    let report = store.evict_to_quota(target);
    store.flush()?;
    info!(
        target_bytes = target,
        entries_removed = report.entries_removed,
        bytes_freed = report.bytes_freed,
        "Eviction finished"
    );
    println!(
        "removed {} entries ({:.1} MiB), {:.1} MiB remaining{}",
        report.entries_removed,
        report.bytes_freed as f64 / MIB,
        report.remaining_bytes as f64 / MIB,
        if report.target_met { "" } else { " (target not met)" }
    );
    Ok(())
}

pub fn rebuild_index(config: &EngineConfig) -> Result<()> {
    let store = CacheStore::rebuild(config.cache.clone())
        .with_context(|| format!("rebuilding index at {}", config.cache.root.display()))?;
    println!(
        "index rebuilt: {} entries, {:.1} MiB",
        store.len(),
        store.used_bytes() as f64 / MIB
    );
    Ok(())
}

// =============================================================================
// Building and export
// =============================================================================

/// Build `level` of a source (the coarsest useful level when `None`).
pub async fn build(config: &EngineConfig, source: &SourceArgs, level: Option<u32>) -> Result<()> {
    let store = open_store(config)?;
    let builder = builder(config, store.clone())?;
    let descriptor = describe(builder.readers(), source)?;
    let level = level.unwrap_or_else(|| builder.max_level(&descriptor));

    let mut progress = builder.subscribe_progress();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = progress.recv().await {
            debug!(
                dataset = %event.dataset,
                level = event.level,
                completion = event.completion,
                stage = %event.stage_desc,
                "Build progress"
            );
        }
    });

    let view = builder.ensure_level(&descriptor, level).await?;
    // Dropping the builder closes the progress channel.
    drop(builder);
    let _ = reporter.await;
    store.flush()?;

    let entry = view.entry();
    println!(
        "{} level {}: {}x{} -> {}",
        descriptor.display_name(),
        level,
        entry.shape.rows,
        entry.shape.cols,
        entry.key
    );
    Ok(())
}

/// How to turn a tile into an image.
#[derive(Debug, Clone)]
pub struct ExportArgs {
    pub level: u32,
    pub row: u32,
    pub col: u32,
    pub colormap: String,
    pub vmin: Option<f32>,
    pub vmax: Option<f32>,
    pub output: PathBuf,
}

/// Colorize one tile of a level and write it as PNG.
pub async fn export_tile(
    config: &EngineConfig,
    source: &SourceArgs,
    export: &ExportArgs,
) -> Result<()> {
    let store = open_store(config)?;
    let builder = builder(config, store.clone())?;
    let pipeline = DerivedPipeline::with_builtins(store.clone());
    let descriptor = describe(builder.readers(), source)?;

    let level = builder.ensure_level(&descriptor, export.level).await?;
    let (vmin, vmax) = match (export.vmin, export.vmax) {
        (Some(lo), Some(hi)) => (lo, hi),
        (lo, hi) => {
            let (data_lo, data_hi) = value_range(&level)
                .ok_or_else(|| anyhow!("level {} has no valid values", export.level))?;
            (lo.unwrap_or(data_lo), hi.unwrap_or(data_hi))
        }
    };

    let recipe = Recipe::colorize(export.colormap.clone(), vmin, vmax);
    let colored = pipeline.compute(&recipe, &[level.key()]).await?;

    let coord = TileCoord::new(export.level, export.row, export.col);
    let grid = config.scheduler.tile_grid();
    let window = grid
        .tile_window(&coord, &colored.entry().shape)
        .ok_or_else(|| anyhow!("tile {} is outside level {}", coord, export.level))?;

    let pixels = colored.copy_window(&window);
    write_png(&export.output, window.cols as u32, window.rows as u32, pixels)?;
    store.flush()?;

    info!(
        tile = %coord,
        colormap = %export.colormap,
        vmin,
        vmax,
        output = %export.output.display(),
        "Exported tile"
    );
    println!(
        "wrote {} ({}x{}, {} {}..{})",
        export.output.display(),
        window.cols,
        window.rows,
        export.colormap,
        vmin,
        vmax
    );
    Ok(())
}

/// Smallest and largest valid value of a float entry.
fn value_range(view: &EntryView) -> Option<(f32, f32)> {
    let sentinel = view.entry().no_data;
    let values = view.as_f32()?;
    values
        .iter()
        .copied()
        .filter(|v| !is_nodata(*v, sentinel))
        .fold(None, |range, v| match range {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

fn write_png(path: &Path, width: u32, height: u32, rgba: Vec<u8>) -> Result<()> {
    let img = image::RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| anyhow!("tile buffer does not match {}x{}", width, height))?;
    img.save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_store::{CacheConfig, EntryMetadata};
    use raster_ops::{write_flat, FlatHeader};
    use test_utils::{create_ramp_grid, grid, raster, TempWorkspace};

    fn engine(ws: &TempWorkspace) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.cache = CacheConfig::new(ws.cache_root(), 16 << 20);
        config.cache.fsync = false;
        config.scheduler.tile_width = 4;
        config.scheduler.tile_height = 4;
        config
    }

    fn flat_source(ws: &TempWorkspace) -> SourceArgs {
        let spec = grid::ODD_5X7;
        let path = ws.source_path("ramp.f32");
        let mut header = FlatHeader::new(spec.rows, spec.cols, spec.geotransform());
        header.dataset_name = Some("ramp".to_string());
        write_flat(&path, &header, &create_ramp_grid(spec.cols, spec.rows)).unwrap();
        SourceArgs {
            path,
            format: None,
            band: None,
        }
    }

    #[test]
    fn test_value_range_skips_nodata() {
        let ws = TempWorkspace::new();
        let store = CacheStore::open(engine(&ws).cache).unwrap();
        let key = sift_common::CacheKey::from_bytes([7; 32]);
        store
            .put(
                key,
                &raster(2, 2, vec![-9999.0, 3.0, f32::NAN, 8.0]),
                EntryMetadata::new(None, Some(-9999.0)),
            )
            .unwrap();

        let view = store.get(&key).unwrap().unwrap();
        assert_eq!(value_range(&view), Some((3.0, 8.0)));
    }

    #[tokio::test]
    async fn test_build_then_export_tile() {
        let ws = TempWorkspace::new();
        let config = engine(&ws);
        let source = flat_source(&ws);

        build(&config, &source, Some(1)).await.unwrap();
        let store = open_store(&config).unwrap();
        // Level 0 and level 1.
        assert_eq!(store.len(), 2);
        drop(store);

        let output = ws.root().join("tile.png");
        let export = ExportArgs {
            level: 0,
            row: 1,
            col: 1,
            colormap: "viridis".to_string(),
            vmin: None,
            vmax: None,
            output: output.clone(),
        };
        export_tile(&config, &source, &export).await.unwrap();

        // Level 0 is 5x7; tile (1, 1) of a 4x4 grid is the 1x3 corner.
        let img = image::open(&output).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (3, 1));
    }

    #[tokio::test]
    async fn test_export_rejects_tile_outside_level() {
        let ws = TempWorkspace::new();
        let config = engine(&ws);
        let source = flat_source(&ws);
        let export = ExportArgs {
            level: 0,
            row: 9,
            col: 9,
            colormap: "viridis".to_string(),
            vmin: Some(0.0),
            vmax: Some(1.0),
            output: ws.root().join("none.png"),
        };
        assert!(export_tile(&config, &source, &export).await.is_err());
    }
}
