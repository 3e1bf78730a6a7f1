extern crate dmap;
extern crate fnv;

#[macro_use]
extern crate measure_time;

use std::env;
use std::fmt;
use std::process;
use std::str::FromStr;

use dmap::hasher::RapidHashMap;
use dmap::{AllocStrategy, Config, DMap};

const USAGE: &str = "Usage: bench [options]
Options:
  -d         evaluate insertion/deletion (insertion only by default)
  -N INT     total number of input items [70000000]
  -n INT     initial number of input items [10000000]
  -0 INT     seed of the key generator [1]
  -k INT     number of checkpoints [11]";

struct Options {
    total: u32,
    initial: u32,
    x0: u64,
    checkpoints: u32,
    delete: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            total: 70_000_000,
            initial: 10_000_000,
            x0: 1,
            checkpoints: 11,
            delete: false,
        }
    }
}

fn parse_number<T>(flag: &str, value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|err| format!("{} {:?}: {}", flag, value, err))
}

fn parse_args<I: Iterator<Item = String>>(mut args: I) -> Result<Options, String> {
    let mut opts = Options::default();
    while let Some(arg) = args.next() {
        if arg == "-d" {
            opts.delete = true;
            continue;
        }
        if !arg.starts_with('-') || !arg.is_char_boundary(2) {
            return Err(format!("unexpected argument {:?}", arg));
        }
        let (flag, inline) = arg.split_at(2);
        let value = if inline.is_empty() {
            args.next().ok_or_else(|| format!("{} needs a value", flag))?
        } else {
            inline.to_string()
        };
        match flag {
            "-N" => opts.total = parse_number(flag, &value)?,
            "-n" => opts.initial = parse_number(flag, &value)?,
            "-0" => opts.x0 = parse_number(flag, &value)?,
            "-k" => opts.checkpoints = parse_number(flag, &value)?,
            _ => return Err(format!("unknown option {}", flag)),
        }
    }
    if opts.checkpoints == 0 {
        return Err("-k must be at least 1".to_string());
    }
    if opts.initial > opts.total {
        return Err("-n must not exceed -N".to_string());
    }
    Ok(opts)
}

#[inline]
fn splitmix64(x: &mut u64) -> u64 {
    *x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[inline]
fn hash32(mut key: u32) -> u32 {
    key = key.wrapping_add(!(key << 15));
    key ^= key >> 10;
    key = key.wrapping_add(key << 3);
    key ^= key >> 6;
    key = key.wrapping_add(!(key << 11));
    key ^= key >> 16;
    key
}

/// Keys repeat about four times over `n` inputs.
#[inline]
fn get_key(n: u32, x: u64) -> u32 {
    hash32(x as u32 % (n >> 2).max(1))
}

/// The two operations the workload needs from a map.
trait Workload {
    /// Adds one to the counter of `key`. Returns the new count.
    fn bump(&mut self, key: u32) -> u32;
    /// Deletes `key` if present, else inserts it. Returns `true` on insert.
    fn toggle(&mut self, key: u32, value: u32) -> bool;
    fn len(&self) -> usize;
}

impl Workload for DMap<u32, u32> {
    fn bump(&mut self, key: u32) -> u32 {
        let (_, counter) = self.get_or_insert_with(&key, || 0);
        *counter += 1;
        *counter
    }

    fn toggle(&mut self, key: u32, value: u32) -> bool {
        if self.delete(&key).is_some() {
            false
        } else {
            self.insert(&key, value);
            true
        }
    }

    fn len(&self) -> usize {
        self.count()
    }
}

macro_rules! std_workload {
    ($map:ty) => {
        impl Workload for $map {
            fn bump(&mut self, key: u32) -> u32 {
                let counter = self.entry(key).or_insert(0);
                *counter += 1;
                *counter
            }

            fn toggle(&mut self, key: u32, value: u32) -> bool {
                if self.remove(&key).is_some() {
                    false
                } else {
                    self.insert(key, value);
                    true
                }
            }

            fn len(&self) -> usize {
                self.len()
            }
        }
    };
}

std_workload!(fnv::FnvHashMap<u32, u32>);
std_workload!(RapidHashMap<u32, u32>);

fn run<M: Workload>(name: &str, mut map: M, opts: &Options) {
    let step = (opts.total - opts.initial) / (opts.checkpoints - 1).max(1);
    let mode = if opts.delete { 'D' } else { 'I' };
    let mut x = opts.x0;
    let mut checksum = 0u64;
    let mut i = 0u32;
    let mut n = opts.initial;

    print_time!(format!("{} total", name));
    for j in 0..opts.checkpoints {
        {
            print_time!(format!("{} checkpoint {}", name, j));
            while i < n {
                let key = get_key(n, splitmix64(&mut x));
                if opts.delete {
                    map.toggle(key, i);
                } else {
                    checksum = checksum.wrapping_add(map.bump(key) as u64);
                }
                i += 1;
            }
        }
        println!("M{}\t{}\t{}\t{}\t{:x}", mode, name, n, map.len(), checksum);
        n = n.saturating_add(step);
    }
}

fn main() {
    let opts = match parse_args(env::args().skip(1)) {
        Ok(opts) => opts,
        Err(err) => {
            eprintln!("{}\n{}", err, USAGE);
            process::exit(1);
        }
    };

    let heap: DMap<u32, u32> = DMap::with_config(Config::default());
    run("dmap-heap", heap, &opts);

    let virt: DMap<u32, u32> = DMap::with_config(Config::default().strategy(AllocStrategy::Virtual));
    run("dmap-virtual", virt, &opts);

    run("FnvHashMap", fnv::FnvHashMap::<u32, u32>::default(), &opts);
    run("RapidHashMap", RapidHashMap::<u32, u32>::default(), &opts);
}
