use rand::Rng;

/// Cap on retained fragments so long campaigns don't grow the model
/// without bound.
const MAX_FRAGMENTS: usize = 4096;

/// Generative model inferred from admitted buffers. Built incrementally:
/// every coverage-growing buffer is folded in via [`Verse::build`], and
/// [`Verse::generate`] splices recorded fragments into new inputs.
#[derive(Debug, Clone)]
pub struct Verse {
    fragments: Vec<Vec<u8>>,
}

impl Verse {
    /// Folds an admitted buffer into the model, extending the previous
    /// model when one exists.
    pub fn build(prev: Option<Verse>, buf: &[u8]) -> Verse {
        let mut verse = prev.unwrap_or(Verse {
            fragments: Vec::new(),
        });
        for fragment in split_fragments(buf) {
            if verse.fragments.len() >= MAX_FRAGMENTS {
                break;
            }
            verse.fragments.push(fragment);
        }
        verse
    }

    /// Synthesizes a buffer by splicing random recorded fragments.
    pub fn generate(&self) -> Vec<u8> {
        let mut rng = rand::rng();
        if self.fragments.is_empty() {
            return vec![rng.random()];
        }
        let mut out = Vec::new();
        for _ in 0..rng.random_range(1..=4u8) {
            let fragment = &self.fragments[rng.random_range(0..self.fragments.len())];
            out.extend_from_slice(fragment);
        }
        out
    }
}

/// Splits a buffer on non-alphanumeric bytes; a buffer with no separators
/// contributes itself as a single fragment.
fn split_fragments(buf: &[u8]) -> Vec<Vec<u8>> {
    let fragments: Vec<Vec<u8>> = buf
        .split(|b| !b.is_ascii_alphanumeric())
        .filter(|f| !f.is_empty())
        .map(|f| f.to_vec())
        .collect();
    if fragments.is_empty() && !buf.is_empty() {
        return vec![buf.to_vec()];
    }
    fragments
}
