use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

struct ClassDef {
    size: usize,
    batch_size: usize,
}

fn auto_batch(size: usize, superblock_size: usize) -> usize {
    if size <= 1024 {
        32
    } else if size <= 4096 {
        (65536 / size).max(2)
    } else {
        (superblock_size / size).max(2)
    }
}

fn auto_class(size: usize, superblock_size: usize) -> ClassDef {
    ClassDef {
        size,
        batch_size: auto_batch(size, superblock_size),
    }
}

#[derive(Deserialize, Default)]
struct ConfigSection {
    superblock_size: Option<usize>,
    local_heap_count: Option<usize>,
    large_object_threshold: Option<usize>,
    bootstrap_arena_size: Option<usize>,
    eviction_fraction_num: Option<usize>,
    eviction_fraction_den: Option<usize>,
    eviction_slack_superblocks: Option<usize>,
    emptiness_bins: Option<usize>,
    tlab_budget_bytes: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
    #[serde(default)]
    classes: Vec<usize>,
    #[serde(default, rename = "class")]
    class_full: Vec<ClassFull>,
}

#[derive(Deserialize)]
struct ClassFull {
    size: usize,
    batch_size: Option<usize>,
}

struct ResolvedConfig {
    superblock_size: usize,
    superblock_shift: u32,
    local_heap_count: usize,
    large_object_threshold: usize,
    bootstrap_arena_size: usize,
    eviction_fraction_num: usize,
    eviction_fraction_den: usize,
    eviction_slack_superblocks: usize,
    emptiness_bins: usize,
    tlab_budget_bytes: usize,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let superblock_size = cfg.superblock_size.unwrap_or(65536);
    assert!(
        superblock_size.is_power_of_two(),
        "superblock_size ({}) must be a power of 2",
        superblock_size
    );
    assert!(
        superblock_size >= 4096,
        "superblock_size ({}) must be >= 4096",
        superblock_size
    );

    let local_heap_count = cfg.local_heap_count.unwrap_or(0);
    let large_object_threshold = cfg.large_object_threshold.unwrap_or(262144);
    let bootstrap_arena_size = cfg.bootstrap_arena_size.unwrap_or(1024 * 1024);
    let eviction_fraction_num = cfg.eviction_fraction_num.unwrap_or(1);
    let eviction_fraction_den = cfg.eviction_fraction_den.unwrap_or(4);
    let eviction_slack_superblocks = cfg.eviction_slack_superblocks.unwrap_or(1);
    let emptiness_bins = cfg.emptiness_bins.unwrap_or(4);
    let tlab_budget_bytes = cfg.tlab_budget_bytes.unwrap_or(65536);

    assert!(
        large_object_threshold > 0 && large_object_threshold <= superblock_size,
        "large_object_threshold ({}) must be > 0 and <= superblock_size ({})",
        large_object_threshold,
        superblock_size
    );
    assert!(bootstrap_arena_size > 0, "bootstrap_arena_size must be > 0");
    assert!(
        eviction_fraction_den > 0 && eviction_fraction_num <= eviction_fraction_den,
        "eviction_fraction_num/den ({}/{}) must satisfy 0 <= num <= den and den > 0",
        eviction_fraction_num,
        eviction_fraction_den
    );
    assert!(emptiness_bins > 0, "emptiness_bins must be > 0");
    assert!(tlab_budget_bytes > 0, "tlab_budget_bytes must be > 0");

    ResolvedConfig {
        superblock_size,
        superblock_shift: superblock_size.trailing_zeros(),
        local_heap_count,
        large_object_threshold,
        bootstrap_arena_size,
        eviction_fraction_num,
        eviction_fraction_den,
        eviction_slack_superblocks,
        emptiness_bins,
        tlab_budget_bytes,
    }
}

fn parse_classes(config: &Config, superblock_size: usize) -> Vec<ClassDef> {
    if !config.classes.is_empty() && !config.class_full.is_empty() {
        panic!("HOARDALLOC_CONFIG: use either `classes = [...]` or `[[class]]`, not both");
    }

    let defs: Vec<ClassDef> = if !config.classes.is_empty() {
        config
            .classes
            .iter()
            .map(|&s| auto_class(s, superblock_size))
            .collect()
    } else if !config.class_full.is_empty() {
        config
            .class_full
            .iter()
            .map(|c| ClassDef {
                size: c.size,
                batch_size: c
                    .batch_size
                    .unwrap_or_else(|| auto_batch(c.size, superblock_size)),
            })
            .collect()
    } else {
        panic!("HOARDALLOC_CONFIG: config must contain `classes` or `[[class]]` entries");
    };

    validate_classes(&defs, superblock_size);
    defs
}

fn validate_classes(defs: &[ClassDef], superblock_size: usize) {
    assert!(!defs.is_empty(), "HOARDALLOC_CONFIG: no size classes defined");
    assert!(
        defs.len() < 64,
        "HOARDALLOC_CONFIG: too many classes ({}, max 63)",
        defs.len()
    );
    for (i, d) in defs.iter().enumerate() {
        assert!(d.size > 0, "class {}: size must be > 0", i);
        assert!(
            d.size % 8 == 0,
            "class {}: size {} must be 8-byte aligned",
            i,
            d.size
        );
        assert!(
            d.size <= superblock_size,
            "class {}: size {} must fit within a superblock ({})",
            i,
            d.size,
            superblock_size
        );
        assert!(d.batch_size > 0, "class {}: batch_size must be > 0", i);
        if i > 0 {
            assert!(
                d.size > defs[i - 1].size,
                "class {}: size {} must be > previous size {}",
                i,
                d.size,
                defs[i - 1].size
            );
        }
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/hoardalloc.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const SB_SHIFT: usize = {};\n\
         pub const SB_SIZE: usize = {};\n\
         pub const DEFAULT_LOCAL_HEAP_COUNT: usize = {};\n\
         pub const S_MAX: usize = {};\n\
         pub const BOOTSTRAP_ARENA_SIZE: usize = {};\n\
         pub const EVICTION_FRACTION_NUM: usize = {};\n\
         pub const EVICTION_FRACTION_DEN: usize = {};\n\
         pub const EVICTION_SLACK_SUPERBLOCKS: usize = {};\n\
         pub const EMPTINESS_BINS: usize = {};\n\
         pub const TLAB_BUDGET_BYTES: usize = {};\n",
        cfg.superblock_shift,
        cfg.superblock_size,
        cfg.local_heap_count,
        cfg.large_object_threshold,
        cfg.bootstrap_arena_size,
        cfg.eviction_fraction_num,
        cfg.eviction_fraction_den,
        cfg.eviction_slack_superblocks,
        cfg.emptiness_bins,
        cfg.tlab_budget_bytes,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn generate_size_classes(defs: &[ClassDef], out_path: &Path) {
    let num_size_classes = defs.len() + 1;

    let mut code = String::from("// Auto-generated by build.rs. Do not edit.\n\n");

    code.push_str(&format!(
        "pub static SIZE_CLASSES: [SizeClassInfo; {num_size_classes}] = [\n\
         \x20   SizeClassInfo {{ size: 0, batch_size: 0 }}, // sentinel\n",
    ));
    for d in defs {
        code.push_str(&format!(
            "    SizeClassInfo {{ size: {}, batch_size: {} }},\n",
            d.size, d.batch_size
        ));
    }
    code.push_str("];\n");

    fs::write(out_path, code).expect("failed to write size_class_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=HOARDALLOC_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("HOARDALLOC_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    let defs = parse_classes(&config, resolved.superblock_size);

    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
    generate_size_classes(&defs, &Path::new(&out_dir).join("size_class_gen.rs"));
}
