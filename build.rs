use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct SlabSection {
    slab_size: Option<usize>,
    cache_line: Option<usize>,
}

#[derive(Deserialize, Default)]
struct BackendSection {
    min_binned_size: Option<usize>,
    bin_step: Option<usize>,
    max_binned_small: Option<usize>,
    max_binned_huge: Option<usize>,
    advance_regions: Option<usize>,
    mem_extend_slots: Option<usize>,
    slabs_per_miss: Option<usize>,
}

#[derive(Deserialize, Default)]
struct LargeCacheSection {
    min_size: Option<usize>,
    max_size: Option<usize>,
    huge_step_factor: Option<usize>,
    cleanup_frequency: Option<usize>,
    default_max_huge_size: Option<usize>,
    large_factors: Option<[usize; 3]>,
    huge_factors: Option<[usize; 3]>,
}

#[derive(Deserialize, Default)]
struct TlsSection {
    free_slab_high_mark: Option<usize>,
    free_slab_low_mark: Option<usize>,
    local_cache_high_mark: Option<usize>,
    local_cache_low_mark: Option<usize>,
    local_cache_max_total: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    slab: SlabSection,
    #[serde(default)]
    backend: BackendSection,
    #[serde(default)]
    large_cache: LargeCacheSection,
    #[serde(default)]
    tls: TlsSection,
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/scmalloc.toml", manifest_dir)
}

fn main() {
    println!("cargo:rerun-if-env-changed=SCMALLOC_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();
    let config_path = env::var("SCMALLOC_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);

    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));
    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let slab_size = config.slab.slab_size.unwrap_or(16 * 1024);
    let cache_line = config.slab.cache_line.unwrap_or(64);

    assert!(
        slab_size.is_power_of_two() && slab_size >= 4096,
        "slab_size ({}) must be a power of 2 and >= 4096",
        slab_size
    );
    assert!(
        cache_line.is_power_of_two() && cache_line >= 32,
        "cache_line ({}) must be a power of 2 and >= 32",
        cache_line
    );

    let min_binned = config.backend.min_binned_size.unwrap_or(8 * 1024);
    let bin_step = config.backend.bin_step.unwrap_or(8 * 1024);
    let max_binned_small = config.backend.max_binned_small.unwrap_or(1024 * 1024);
    let max_binned_huge = config.backend.max_binned_huge.unwrap_or(4 * 1024 * 1024);
    let advance_regions = config.backend.advance_regions.unwrap_or(3);
    let mem_extend_slots = config.backend.mem_extend_slots.unwrap_or(3);
    let slabs_per_miss = config.backend.slabs_per_miss.unwrap_or(2);

    assert!(bin_step > 0 && min_binned % bin_step == 0);
    assert!(
        max_binned_small < max_binned_huge,
        "max_binned_small must be below max_binned_huge"
    );
    assert!(
        (max_binned_huge - min_binned) % bin_step == 0,
        "bin range must be a whole number of steps"
    );
    assert!(min_binned >= slab_size, "bins start at one slab at least");
    assert!(mem_extend_slots > 0 && slabs_per_miss > 0);

    let lc_min = config.large_cache.min_size.unwrap_or(8 * 1024);
    let lc_max = config.large_cache.max_size.unwrap_or(8 * 1024 * 1024);
    let huge_step_factor = config.large_cache.huge_step_factor.unwrap_or(8);
    let cleanup_freq = config.large_cache.cleanup_frequency.unwrap_or(256);
    let default_max_huge = config
        .large_cache
        .default_max_huge_size
        .unwrap_or(64 * 1024 * 1024);
    let large_factors = config.large_cache.large_factors.unwrap_or([2, 2, 16]);
    let huge_factors = config.large_cache.huge_factors.unwrap_or([1, 1, 4]);

    assert!(lc_min == min_binned, "LOC min size must match backend bins");
    assert!(lc_max.is_power_of_two(), "LOC large/huge boundary must be a power of 2");
    assert!(
        huge_step_factor.is_power_of_two(),
        "huge_step_factor must be a power of 2"
    );
    assert!(
        cleanup_freq.is_power_of_two(),
        "cleanup_frequency must be a power of 2 for the fast range check"
    );

    let fs_high = config.tls.free_slab_high_mark.unwrap_or(32);
    let fs_low = config.tls.free_slab_low_mark.unwrap_or(8);
    let lc_high = config.tls.local_cache_high_mark.unwrap_or(32);
    let lc_low = config.tls.local_cache_low_mark.unwrap_or(8);
    let lc_total = config.tls.local_cache_max_total.unwrap_or(4 * 1024 * 1024);

    assert!(fs_low > 1 && fs_low < fs_high, "slab pool marks out of order");
    assert!(lc_low > 0 && lc_low < lc_high, "local cache marks out of order");

    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const SLAB_SIZE: usize = {slab_size};\n\
         pub const CACHE_LINE: usize = {cache_line};\n\
         pub const MIN_BINNED_SIZE: usize = {min_binned};\n\
         pub const FREE_BINS_STEP: usize = {bin_step};\n\
         pub const MAX_BINNED_SMALL: usize = {max_binned_small};\n\
         pub const MAX_BINNED_HUGE: usize = {max_binned_huge};\n\
         pub const ADVANCE_REGIONS: usize = {advance_regions};\n\
         pub const MEM_EXTEND_SLOTS: isize = {mem_extend_slots};\n\
         pub const SLABS_PER_MISS: usize = {slabs_per_miss};\n\
         pub const LARGE_CACHE_MIN_SIZE: usize = {lc_min};\n\
         pub const LARGE_CACHE_MAX_SIZE: usize = {lc_max};\n\
         pub const HUGE_STEP_FACTOR: usize = {huge_step_factor};\n\
         pub const CACHE_CLEANUP_FREQ: usize = {cleanup_freq};\n\
         pub const DEFAULT_MAX_HUGE_SIZE: usize = {default_max_huge};\n\
         pub const LARGE_TOO_LARGE_FACTOR: usize = {};\n\
         pub const LARGE_ON_MISS_FACTOR: usize = {};\n\
         pub const LARGE_LONG_WAIT_FACTOR: usize = {};\n\
         pub const HUGE_TOO_LARGE_FACTOR: usize = {};\n\
         pub const HUGE_ON_MISS_FACTOR: usize = {};\n\
         pub const HUGE_LONG_WAIT_FACTOR: usize = {};\n\
         pub const FREE_SLAB_POOL_HIGH_MARK: usize = {fs_high};\n\
         pub const FREE_SLAB_POOL_LOW_MARK: usize = {fs_low};\n\
         pub const LOCAL_CACHE_HIGH_MARK: usize = {lc_high};\n\
         pub const LOCAL_CACHE_LOW_MARK: usize = {lc_low};\n\
         pub const LOCAL_CACHE_MAX_TOTAL: usize = {lc_total};\n",
        large_factors[0],
        large_factors[1],
        large_factors[2],
        huge_factors[0],
        huge_factors[1],
        huge_factors[2],
    );
    fs::write(Path::new(&out_dir).join("config_gen.rs"), code).expect("failed to write config_gen.rs");
}
