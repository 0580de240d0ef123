use std::collections::{HashSet, VecDeque};

use rand::Rng;

/// Collaborator the scheduling loop draws inputs from and admits
/// coverage-growing buffers into. Selection and mutation strategy live
/// entirely behind this seam.
pub trait Corpus {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// FIFO draw for regression replay. `None` once exhausted.
    fn shift(&mut self) -> Option<Vec<u8>>;
    /// Seed/mutation draw for fuzz mode.
    fn generate_input(&mut self) -> Vec<u8>;
    /// Admit a buffer that grew coverage.
    fn put_buffer(&mut self, buf: &[u8]);
}

/// Minimal in-memory corpus: seeded entries, fingerprint dedup on
/// admission, and a handful of byte-level mutations for generation.
pub struct InMemoryCorpus {
    entries: Vec<Vec<u8>>,
    queue: VecDeque<Vec<u8>>,
    fingerprints: HashSet<[u8; 16]>,
    only_ascii: bool,
}

impl InMemoryCorpus {
    pub fn new(seeds: Vec<Vec<u8>>, only_ascii: bool) -> Self {
        let mut corpus = Self {
            entries: Vec::new(),
            queue: VecDeque::new(),
            fingerprints: HashSet::new(),
            only_ascii,
        };
        for seed in seeds {
            if corpus.insert(seed.clone()) {
                corpus.queue.push_back(seed);
            }
        }
        corpus
    }

    fn insert(&mut self, buf: Vec<u8>) -> bool {
        let fingerprint = md5::compute(&buf).0;
        if !self.fingerprints.insert(fingerprint) {
            return false;
        }
        self.entries.push(buf);
        true
    }

    fn mutate(&self, buf: &mut Vec<u8>, rng: &mut impl Rng) {
        match rng.random_range(0..4u8) {
            0 if !buf.is_empty() => {
                let idx = rng.random_range(0..buf.len());
                buf[idx] ^= 1 << rng.random_range(0..8u8);
            }
            1 if !buf.is_empty() => {
                let idx = rng.random_range(0..buf.len());
                buf[idx] = rng.random();
            }
            2 => {
                let idx = rng.random_range(0..=buf.len());
                buf.insert(idx, rng.random());
            }
            _ if buf.len() > 1 => {
                let idx = rng.random_range(0..buf.len());
                buf.remove(idx);
            }
            _ => buf.push(rng.random()),
        }
    }
}

impl Corpus for InMemoryCorpus {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn shift(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }

    fn generate_input(&mut self) -> Vec<u8> {
        let mut rng = rand::rng();
        let mut buf = if self.entries.is_empty() {
            (0..rng.random_range(1..=64usize))
                .map(|_| rng.random())
                .collect()
        } else {
            self.entries[rng.random_range(0..self.entries.len())].clone()
        };
        for _ in 0..rng.random_range(1..=4u8) {
            self.mutate(&mut buf, &mut rng);
        }
        if buf.is_empty() {
            buf.push(rng.random());
        }
        if self.only_ascii {
            to_ascii(&mut buf);
        }
        buf
    }

    fn put_buffer(&mut self, buf: &[u8]) {
        if self.insert(buf.to_vec()) {
            self.queue.push_back(buf.to_vec());
        }
    }
}

/// Maps arbitrary bytes onto printable ASCII, preserving length.
fn to_ascii(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        *b &= 0x7f;
        if !b.is_ascii_graphic() && *b != b' ' {
            *b = b' ';
        }
    }
}
