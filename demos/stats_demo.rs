use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;

use clap::Parser;
use swiss_table::HashTable;
use swiss_table::hash_table::Entry;
use swiss_table::sampler;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short = 'c', long = "target_capacity", default_value_t = 1000)]
    target_capacity: usize,

    /// Fraction of elements to erase before printing statistics, in
    /// percent.
    #[arg(short = 'e', long = "erase_percent", default_value_t = 25)]
    erase_percent: usize,
}

fn hash_u64(value: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn main() {
    let args = Args::parse();

    sampler::set_sampling_enabled(true);
    sampler::set_sampling_stride(1);
    sampler::reset_thread_sample_countdown();

    println!(
        "Creating HashTable with target capacity: {}",
        args.target_capacity
    );

    let mut table: HashTable<u64> = HashTable::with_capacity(args.target_capacity);
    println!("Actual capacity: {}", table.capacity());
    println!("Filling table with u64 values...");

    let num_values = table.capacity();
    let mut num_fallbacks = 0;
    for i in 0..num_values {
        let value = i as u64;
        let hash = hash_u64(value);

        match table.try_entry(hash, |&v| v == value) {
            Ok(Entry::Vacant(entry)) => {
                entry.insert(value);
                continue;
            }
            Ok(Entry::Occupied(_)) => {
                panic!("Value already exists in table: {}", value);
            }
            Err(_) => {
                num_fallbacks += 1;
            }
        }

        match table.entry(hash, |&v| v == value, |&v| hash_u64(v)) {
            Entry::Vacant(entry) => {
                entry.insert(value);
            }
            Entry::Occupied(_) => {
                panic!("Value already exists in table: {}", value);
            }
        }
    }
    println!("Inserts that needed the growing entry path: {}", num_fallbacks);

    println!("\nAfter filling to capacity:");
    table.debug_stats().print();
    table.probe_histogram(|&v| hash_u64(v)).print();

    let erase_count = num_values * args.erase_percent / 100;
    println!("\nErasing {} values...", erase_count);
    for i in 0..erase_count {
        let value = i as u64;
        let hash = hash_u64(value);
        if table.remove(hash, |&v| v == value).is_none() {
            panic!("Value missing from table: {}", value);
        }
    }

    println!("\nAfter erasing:");
    table.debug_stats().print();
    table.probe_histogram(|&v| hash_u64(v)).print();

    println!("\nRebuilding in place...");
    table.rehash(0, |&v| hash_u64(v));

    println!("\nAfter rebuild:");
    table.debug_stats().print();
    table.probe_histogram(|&v| hash_u64(v)).print();

    println!("\nSampler registry:");
    sampler::for_each_sample(|stats| {
        println!(
            "  slot_size={} capacity={} size={} erases={} rehashes={} \
             total_probe={} max_probe={} max_reserve={} hash_xor={:#x}",
            stats.slot_size(),
            stats.capacity(),
            stats.size(),
            stats.num_erases(),
            stats.num_rehashes(),
            stats.total_probe_length(),
            stats.max_probe_length(),
            stats.max_reserve(),
            stats.hashes_bitwise_xor(),
        );
    });
}
