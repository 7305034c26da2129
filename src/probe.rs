// src/probe.rs
//
// =============================================================================
// CAMPUSGRID: SYSTEM PROBE (v 0.1 )
// =============================================================================
//
// The inventory taker.
//
// Responsibilities:
// 1. Detect CPU cores and model, installed RAM, NVIDIA GPUs, and whether a
//    container runtime is usable.
// 2. Degrade gracefully: every field has a documented fallback so a worker
//    on a locked-down machine still registers (1 core, "Unknown", 4 GB,
//    no GPU, no container runtime).
//
// Runs once at worker startup; the result is sent with `register` and never
// refreshed.

use crate::core::WorkerSpecs;
use std::process::Command;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// Detect this machine's capabilities.
pub fn probe() -> WorkerSpecs {
    let (cpu_model, ram_gb) = detect_cpu_mem();
    let gpu = detect_gpu();
    let has_docker = detect_container_runtime();

    let specs = WorkerSpecs {
        cpu_cores: num_cpus::get_physical().max(1) as u32,
        cpu_model,
        ram_gb,
        gpu_name: gpu.as_ref().map(|g| g.0.clone()),
        gpu_memory_gb: gpu.as_ref().map(|g| g.1),
        has_docker,
    };

    log::info!(
        "Probed specs: {} cores ({}), {:.1} GB RAM, GPU: {}, container runtime: {}",
        specs.cpu_cores,
        specs.cpu_model,
        specs.ram_gb,
        specs.gpu_name.as_deref().unwrap_or("none"),
        if has_docker { "yes" } else { "no" }
    );

    specs
}

fn detect_cpu_mem() -> (String, f64) {
    let sys = System::new_with_specifics(
        RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything()),
    );

    let model = sys
        .cpus()
        .first()
        .map(|c| c.brand().trim().to_string())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| "Unknown".into());

    let total_bytes = sys.total_memory();
    let ram_gb = if total_bytes == 0 {
        4.0
    } else {
        round2(total_bytes as f64 / f64::from(1024u32.pow(3)))
    };

    (model, ram_gb)
}

/// First NVIDIA device as (name, memory in GB), via nvidia-smi.
fn detect_gpu() -> Option<(String, f64)> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.total", "--format=csv,noheader"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let (name, mem) = line.split_once(',')?;

    // memory.total prints like "8192 MiB"
    let mem_mib: f64 = mem
        .trim()
        .trim_end_matches("MiB")
        .trim()
        .parse()
        .unwrap_or(0.0);

    Some((name.trim().to_string(), round2(mem_mib / 1024.0)))
}

/// A runtime counts as usable only if the daemon answers, not merely if the
/// binary is on PATH.
fn detect_container_runtime() -> bool {
    Command::new("docker")
        .arg("info")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
