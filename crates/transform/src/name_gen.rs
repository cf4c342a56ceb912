//! Identifier generation.
//!
//! One [`NamePool`] lives on the pipeline driver; every name any pass emits
//! is deduplicated against it for the whole run. The nested pipeline used for
//! runtime-generated functions gets its own pool, so its output is
//! self-contained.

use std::collections::HashSet;

use rand::{rngs::StdRng, Rng};
use umbra_core::scope::is_reserved;
use umbra_utils::errors::OptionsError;

use crate::probability::{DecideContext, ProbabilitySpec};

/// The recognized identifier generator modes.
pub const MODES: &[&str] = &["randomized", "hexadecimal", "mangled", "number", "zeroWidth"];

/// Keywords used as the visible stem of zero-width identifiers.
const ZERO_WIDTH_STEMS: &[&str] = &["if", "in", "for", "new", "try", "var", "typeof"];

const ZERO_WIDTH_NON_JOINER: char = '\u{200C}';

/// Run-wide identifier factory with a dedup set and the counters behind the
/// deterministic modes.
#[derive(Debug, Default)]
pub struct NamePool {
    generated: HashSet<String>,
    var_count: u64,
    mangled_count: u64,
    zero_width_count: u64,
}

impl NamePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of names handed out so far.
    pub fn count(&self) -> usize {
        self.generated.len()
    }

    /// True if this pool already produced `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.generated.contains(name)
    }

    /// Generates one identifier in the given mode, unique for this run and
    /// outside the reserved keyword/identifier sets.
    ///
    /// # Errors
    /// [`OptionsError::UnknownIdentifierGenerator`] when the mode is not one
    /// of [`MODES`] — raised here, at the point of consumption.
    pub fn generate(&mut self, mode: &str, rng: &mut StdRng) -> Result<String, OptionsError> {
        if !MODES.contains(&mode) {
            return Err(OptionsError::UnknownIdentifierGenerator(mode.to_string()));
        }
        loop {
            let candidate = match mode {
                "randomized" => randomized(rng),
                "hexadecimal" => hexadecimal(rng),
                "mangled" => {
                    let n = self.mangled_count;
                    self.mangled_count += 1;
                    mangled(n)
                }
                "number" => {
                    let n = self.var_count;
                    self.var_count += 1;
                    format!("var_{n}")
                }
                "zeroWidth" => {
                    let n = self.zero_width_count;
                    self.zero_width_count += 1;
                    zero_width(n, rng)
                }
                _ => unreachable!("mode checked above"),
            };
            if !is_reserved(&candidate) && self.generated.insert(candidate.clone()) {
                return Ok(candidate);
            }
        }
    }

    /// Generates an identifier using the run's `identifierGenerator` spec,
    /// falling back to `randomized` when the spec carries no mode.
    pub fn from_spec(
        &mut self,
        spec: &ProbabilitySpec,
        rng: &mut StdRng,
        cx: &DecideContext<'_>,
    ) -> Result<String, OptionsError> {
        let mode = spec
            .mode(rng, cx)
            .unwrap_or_else(|| "randomized".to_string());
        self.generate(&mode, rng)
    }

    /// An independent generator whose deterministic counters restart from
    /// zero but whose dedup set already contains every name this pool has
    /// produced, so the two never collide on prior output.
    pub fn split(&self) -> NamePool {
        NamePool {
            generated: self.generated.clone(),
            var_count: 0,
            mangled_count: 0,
            zero_width_count: 0,
        }
    }

    /// A `__p_` placeholder: the prefix plus ten decimal digits, unique
    /// within the run.
    pub fn placeholder(&mut self, rng: &mut StdRng) -> String {
        loop {
            let candidate = format!("__p_{:010}", rng.random_range(0..10_000_000_000u64));
            if self.generated.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}

fn randomized(rng: &mut StdRng) -> String {
    const FIRST: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    const REST: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let len = rng.random_range(6..=8);
    let mut name = String::with_capacity(len);
    name.push(FIRST[rng.random_range(0..FIRST.len())] as char);
    for _ in 1..len {
        name.push(REST[rng.random_range(0..REST.len())] as char);
    }
    name
}

fn hexadecimal(rng: &mut StdRng) -> String {
    const HEX: &[u8] = b"0123456789ABCDEF";
    let mut name = String::from("_0x");
    for _ in 0..6 {
        name.push(HEX[rng.random_range(0..HEX.len())] as char);
    }
    name
}

/// Excel-column style: `a, b, …, z, aa, ab, …`.
fn mangled(n: u64) -> String {
    let mut n = n + 1;
    let mut out = Vec::new();
    while n > 0 {
        n -= 1;
        out.push(b'a' + (n % 26) as u8);
        n /= 26;
    }
    out.reverse();
    String::from_utf8(out).expect("ascii")
}

/// A keyword stem followed by `count + 1` zero-width non-joiners. Visually
/// indistinguishable from the bare keyword, but a distinct identifier.
fn zero_width(count: u64, rng: &mut StdRng) -> String {
    let stem = ZERO_WIDTH_STEMS[rng.random_range(0..ZERO_WIDTH_STEMS.len())];
    let mut name = String::from(stem);
    for _ in 0..=count {
        name.push(ZERO_WIDTH_NON_JOINER);
    }
    name
}
