//! Die-roll collaborator.
//!
//! A roll request carries a spec such as `attack=d20+5` or
//! `2d6+1d4-1; damage=3d8`. Each `;`-separated part is rolled on its own
//! and becomes one `ROLL` result. A part is an optional `title=` followed
//! by terms joined with `+` or `-`, where a term is `[N]dS` (N dice of S
//! sides, N defaulting to 1) or a plain integer.

use mapforge_protocol::{DieDetail, DieRollResult};
use rand::Rng;

/// Most dice a single term may roll.
pub const MAX_DICE: u32 = 1000;

/// Most sides a single die may have.
pub const MAX_SIDES: u32 = 10_000;

/// A die-roll spec that could not be understood.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid die-roll spec {spec:?}: {reason}")]
pub struct DiceError {
    pub spec: String,
    pub reason: String,
}

impl DiceError {
    fn new(spec: &str, reason: impl Into<String>) -> Self {
        Self {
            spec: spec.to_owned(),
            reason: reason.into(),
        }
    }
}

/// One rolled part of a spec.
#[derive(Debug, Clone, PartialEq)]
pub struct RolledDice {
    /// The part's title, or the expression itself when it has none.
    pub title: String,
    pub result: DieRollResult,
}

/// Rolls die-roll specs.
pub trait DiceRoller: Send + Sync + 'static {
    /// Rolls every part of `spec`, in order.
    ///
    /// # Errors
    /// [`DiceError`] if any part is malformed; nothing is rolled then.
    fn roll(&self, spec: &str) -> Result<Vec<RolledDice>, DiceError>;
}

/// Source of single die results.
pub trait DieSource: Send + Sync + 'static {
    /// A uniformly random value in `1..=sides`.
    fn roll_die(&self, sides: u32) -> u32;
}

/// [`DieSource`] backed by the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadDieSource;

impl DieSource for ThreadDieSource {
    fn roll_die(&self, sides: u32) -> u32 {
        rand::rng().random_range(1..=sides)
    }
}

/// The bundled [`DiceRoller`].
#[derive(Debug, Clone, Default)]
pub struct BasicDiceRoller<S = ThreadDieSource> {
    source: S,
}

impl BasicDiceRoller {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S: DieSource> BasicDiceRoller<S> {
    /// A roller drawing die results from `source`.
    pub fn with_source(source: S) -> Self {
        Self { source }
    }

    fn roll_part(&self, part: &str) -> Result<RolledDice, DiceError> {
        let (title, expr) = match part.split_once('=') {
            Some((title, expr)) => (title.trim(), expr.trim()),
            None => ("", part.trim()),
        };
        let terms = parse_expr(expr).map_err(|reason| DiceError::new(part, reason))?;

        let mut total: i64 = 0;
        let mut details = Vec::new();
        for (i, term) in terms.iter().enumerate() {
            if i > 0 || term.negative {
                details.push(detail("operator", if term.negative { "-" } else { "+" }));
            }
            let value = match term.kind {
                TermKind::Dice { count, sides } => {
                    let rolls: Vec<u32> = (0..count).map(|_| self.source.roll_die(sides)).collect();
                    details.push(detail("diespec", &format!("{count}d{sides}")));
                    details.push(detail(
                        "roll",
                        &rolls.iter().map(u32::to_string).collect::<Vec<_>>().join(","),
                    ));
                    rolls.iter().map(|&r| i64::from(r)).sum::<i64>()
                }
                TermKind::Constant(k) => {
                    details.push(detail("constant", &k.to_string()));
                    k
                }
            };
            total = if term.negative {
                total.saturating_sub(value)
            } else {
                total.saturating_add(value)
            };
        }

        Ok(RolledDice {
            title: if title.is_empty() { expr.to_owned() } else { title.to_owned() },
            result: DieRollResult {
                result: total,
                details,
                invalid_request: false,
            },
        })
    }
}

impl<S: DieSource> DiceRoller for BasicDiceRoller<S> {
    fn roll(&self, spec: &str) -> Result<Vec<RolledDice>, DiceError> {
        let parts: Vec<&str> = spec.split(';').filter(|p| !p.trim().is_empty()).collect();
        if parts.is_empty() {
            return Err(DiceError::new(spec, "nothing to roll"));
        }
        parts.into_iter().map(|p| self.roll_part(p)).collect()
    }
}

fn detail(kind: &str, value: &str) -> DieDetail {
    DieDetail {
        kind: kind.to_owned(),
        value: value.to_owned(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TermKind {
    Dice { count: u32, sides: u32 },
    Constant(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Term {
    negative: bool,
    kind: TermKind,
}

fn parse_expr(expr: &str) -> Result<Vec<Term>, String> {
    let compact: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err("empty expression".into());
    }

    let mut terms = Vec::new();
    let mut negative = false;
    let mut current = String::new();
    for c in compact.chars() {
        if c == '+' || c == '-' {
            if current.is_empty() && !terms.is_empty() {
                return Err(format!("operator {c:?} without a term before it"));
            }
            if !current.is_empty() {
                terms.push(Term {
                    negative,
                    kind: parse_term(&current)?,
                });
                current.clear();
            }
            negative = c == '-';
        } else {
            current.push(c);
        }
    }
    if current.is_empty() {
        return Err("expression ends with an operator".into());
    }
    terms.push(Term {
        negative,
        kind: parse_term(&current)?,
    });
    Ok(terms)
}

fn parse_term(term: &str) -> Result<TermKind, String> {
    let lower = term.to_ascii_lowercase();
    let Some((count, sides)) = lower.split_once('d') else {
        return lower
            .parse::<i64>()
            .map(TermKind::Constant)
            .map_err(|_| format!("{term:?} is neither a number nor NdS"));
    };

    let count = if count.is_empty() {
        1
    } else {
        count
            .parse::<u32>()
            .map_err(|_| format!("bad die count in {term:?}"))?
    };
    let sides = sides
        .parse::<u32>()
        .map_err(|_| format!("bad die size in {term:?}"))?;

    if count == 0 || count > MAX_DICE {
        return Err(format!("die count must be 1..={MAX_DICE}"));
    }
    if sides == 0 || sides > MAX_SIDES {
        return Err(format!("die size must be 1..={MAX_SIDES}"));
    }
    Ok(TermKind::Dice { count, sides })
}
