use morton_filter::{BlockLayout, MortonFilter};
use rayon::prelude::*;
use std::time::SystemTime;

/// Inserts `item0..itemN-1`, then sweeps the whole range checking
/// membership. Queries touch the filter read-only, so the sweep fans out
/// over all cores.
fn main() -> anyhow::Result<()> {
    use std::env;
    let args: Vec<String> = env::args().collect();
    let num_items: u64 = args[1].parse()?;
    let layout = BlockLayout::default();
    let blocks: usize = if args.len() > 2 {
        args[2].parse()?
    } else {
        num_items as usize / layout.fingerprints_per_block + 1
    };
    let seed: u64 = if args.len() > 3 { args[3].parse()? } else { 1337 };

    let mut filter = MortonFilter::with_layout(blocks, layout, seed)?;
    let start_inserting = SystemTime::now();
    for i in 0..num_items {
        filter.insert(format!("item{}", i).as_bytes())?;
    }
    let insert_duration = start_inserting.elapsed()?;
    eprintln!(
        "tp;bench insert: {} elems in {:?} ({:?} ops)",
        num_items,
        insert_duration,
        num_items as u128 * 1000 / insert_duration.as_millis().max(1)
    );

    let start_querying = SystemTime::now();
    let false_negatives = (0..num_items)
        .into_par_iter()
        .filter(|i| !filter.check(format!("item{}", i).as_bytes()))
        .count();
    let query_duration = start_querying.elapsed()?;
    eprintln!(
        "tp;bench query: queried {} elems in {:?} ({:?} ops)",
        num_items,
        query_duration,
        num_items as u128 * 1000 / query_duration.as_millis().max(1)
    );
    eprintln!(
        "tp;correctness: {} false negatives, fill rate {:.1}%",
        false_negatives,
        filter.items() as f64 / (blocks * layout.fingerprints_per_block) as f64 * 100.0
    );
    anyhow::ensure!(false_negatives == 0, "membership sweep lost items");
    Ok(())
}
