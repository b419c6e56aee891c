use std::thread;

use argh::FromArgs;
use tracing::Level;

use tablekv::test::MemoryLog;
use tablekv::Table;

#[derive(Debug, FromArgs)]
/// Runs a simple concurrent write/read workload against a table.
struct Opts {
    #[argh(switch)]
    /// emit debug info
    debug: bool,

    #[argh(option, default = "4")]
    /// number of writer threads to spawn
    num_threads: usize,

    #[argh(option, default = "10_000")]
    /// number of key/value pairs each thread writes
    num_records: usize,
}

fn main() {
    let opts: Opts = argh::from_env();

    if opts.debug {
        tracing_subscriber::fmt().with_max_level(Level::TRACE).init();
    }

    let table: Table<MemoryLog> = Table::new(&["bench"], MemoryLog::new()).unwrap();

    let mut handles = Vec::with_capacity(opts.num_threads);
    for thread_id in 0..opts.num_threads {
        let table = table.clone();
        let num_records = opts.num_records;
        let handle = thread::spawn(move || {
            for i in 0..num_records {
                let key = format!("thread{thread_id}-key{i}").into_bytes();
                let value = format!("value {i}").into_bytes();
                table
                    .write(&[(key.clone(), Some(value), i as i64)], "bench")
                    .unwrap();
                table.read(&key, "bench", false).unwrap();
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.join().unwrap();
    }

    println!("hit rate: {:.2}", table.hit_rate("bench").unwrap());
}
