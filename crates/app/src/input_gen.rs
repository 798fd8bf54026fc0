//! Sample input for replay runs.
//!
//! Without `--in`, the master replays a generated file. Its content is a
//! seeded mix of text lines, byte runs and random blocks so packets of every
//! shape show up: full packets, short tails and chunks that straddle packet
//! boundaries.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io::Write;
use std::path::Path;

/// Generate `size_bytes` of deterministic sample data.
pub fn generate_sample_data(seed: u64, size_bytes: usize) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut data = Vec::with_capacity(size_bytes);

    while data.len() < size_bytes {
        let block = rng.gen_range(16..=3000).min(size_bytes - data.len());
        match rng.gen_range(0..3) {
            0 => {
                let words = ["frame", "node", "texture", "sync", "barrier", "height", "tile"];
                let start = data.len();
                while data.len() - start < block {
                    let line = format!(
                        "{} {} {}\n",
                        words[rng.gen_range(0..words.len())],
                        rng.gen_range(0..10_000),
                        words[rng.gen_range(0..words.len())]
                    );
                    data.extend_from_slice(line.as_bytes());
                }
            }
            1 => {
                let value: u8 = rng.gen();
                data.extend(std::iter::repeat(value).take(block));
            }
            _ => data.extend((0..block).map(|_| rng.gen::<u8>())),
        }
    }

    data.truncate(size_bytes);
    data
}

/// Write generated data to `path`.
pub fn write_sample_file(path: &Path, seed: u64, size_bytes: usize) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(&generate_sample_data(seed, size_bytes))?;
    file.sync_all()
}
