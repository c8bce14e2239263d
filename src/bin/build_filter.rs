use itertools::Itertools;
use morton_filter::{BlockLayout, MortonFilter};
use std::fs;
use std::time::SystemTime;

/// Builds a Morton filter from a newline-separated item file and writes the
/// serialized bit dump to the output path. An optional third argument fixes
/// the block count; by default one block is allocated per 46 distinct items.
fn main() -> anyhow::Result<()> {
    use std::env;
    let args: Vec<String> = env::args().collect();
    let input_path = &args[1];
    let output_path = &args[2];

    let input = fs::read_to_string(input_path)?;
    let items: Vec<&str> = input.lines().filter(|line| !line.is_empty()).collect();
    let distinct = items.iter().unique().count();
    let layout = BlockLayout::default();
    let blocks: usize = if args.len() > 3 {
        args[3].parse()?
    } else {
        distinct / layout.fingerprints_per_block + 1
    };

    // fixed eviction seed, downstream consumers expect reproducible output
    let mut filter = MortonFilter::with_layout(blocks, layout, 1337)?;
    let start_building = SystemTime::now();
    for item in &items {
        filter.insert(item.as_bytes())?;
    }
    let build_duration = start_building.elapsed()?;
    for item in &items {
        anyhow::ensure!(filter.check(item.as_bytes()), "false negative for '{}'", item);
    }
    fs::write(output_path, filter.serialize())?;
    eprintln!(
        "tp;build: {} items ({} distinct) into {} blocks in {:?}",
        items.len(),
        distinct,
        blocks,
        build_duration
    );
    eprintln!(
        "tp;fill rate: {:.1}%",
        filter.items() as f64 / (blocks * layout.fingerprints_per_block) as f64 * 100.0
    );
    Ok(())
}
