//! Size-targeted encode search
//!
//! A small state machine that finds the highest quality whose encoding fits
//! a byte budget, shrinking the frame when no quality fits:
//!
//! ```text
//! SearchingQuality --(no quality fits)--> ReducingDimensions --> SearchingQuality
//!        |                                        |
//!        +--> Success                             +--> Unreachable
//! ```
//!
//! Both loops are bounded, so a search always terminates. The search only
//! knows about dimensions and byte lengths; the actual resize and encode is
//! the caller's closure.

pub const MIN_QUALITY: u8 = 10;
pub const MAX_QUALITY: u8 = 95;
/// ceil(log2(86)) is 7; the cap leaves headroom without allowing a runaway
pub const MAX_QUALITY_STEPS: u32 = 10;
pub const MAX_REDUCTIONS: u32 = 24;
pub const REDUCTION_FACTOR: f64 = 0.85;
/// Frames are never shrunk below this long edge
pub const MIN_LONG_EDGE: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn long_edge(&self) -> u32 {
        self.width.max(self.height)
    }

    /// Scaled down, aspect preserved, so the long edge is at most `max_edge`
    pub fn fit_within(&self, max_edge: u32) -> Self {
        let long = self.long_edge();
        if long <= max_edge {
            return *self;
        }
        let scale = max_edge as f64 / long as f64;
        let fit = |edge: u32| ((edge as f64 * scale).round() as u32).clamp(1, max_edge);
        Self {
            width: fit(self.width),
            height: fit(self.height),
        }
    }

    /// Both edges scaled by `REDUCTION_FACTOR`, rounded to the nearest pixel
    pub fn reduced(&self) -> Self {
        let scale = |edge: u32| ((edge as f64 * REDUCTION_FACTOR).round() as u32).max(1);
        Self {
            width: scale(self.width),
            height: scale(self.height),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub quality: u8,
    pub dimensions: Dimensions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchState {
    SearchingQuality {
        dimensions: Dimensions,
        low: u8,
        high: u8,
        best: Option<Encoded>,
        steps: u32,
    },
    ReducingDimensions {
        from: Dimensions,
    },
    Success(Encoded),
    Unreachable {
        smallest: Dimensions,
    },
}

impl SearchState {
    pub fn searching(dimensions: Dimensions) -> Self {
        SearchState::SearchingQuality {
            dimensions,
            low: MIN_QUALITY,
            high: MAX_QUALITY,
            best: None,
            steps: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SearchState::Success(_) | SearchState::Unreachable { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Success(Encoded),
    Unreachable { smallest: Dimensions },
}

pub struct SizeSearch<F> {
    target: usize,
    encode: F,
    reductions: u32,
    encodes: u32,
}

impl<F, E> SizeSearch<F>
where
    F: FnMut(Dimensions, u8) -> Result<Vec<u8>, E>,
{
    pub fn new(target: usize, encode: F) -> Self {
        Self {
            target,
            encode,
            reductions: 0,
            encodes: 0,
        }
    }

    /// Number of encodes performed so far
    pub fn encodes(&self) -> u32 {
        self.encodes
    }

    pub fn reductions(&self) -> u32 {
        self.reductions
    }

    /// Advances the machine by one transition
    pub fn step(&mut self, state: SearchState) -> Result<SearchState, E> {
        match state {
            SearchState::SearchingQuality {
                dimensions,
                low,
                high,
                best,
                steps,
            } => {
                if low > high || steps >= MAX_QUALITY_STEPS {
                    return Ok(match best {
                        Some(encoded) => SearchState::Success(encoded),
                        None => SearchState::ReducingDimensions { from: dimensions },
                    });
                }

                let mid = ((u16::from(low) + u16::from(high)) / 2) as u8;
                let bytes = (self.encode)(dimensions, mid)?;
                self.encodes += 1;

                let (low, high, best) = if bytes.len() <= self.target {
                    let encoded = Encoded {
                        bytes,
                        quality: mid,
                        dimensions,
                    };
                    (mid.saturating_add(1), high, Some(encoded))
                } else {
                    // mid >= MIN_QUALITY > 0, so this cannot wrap
                    (low, mid.saturating_sub(1), best)
                };

                Ok(SearchState::SearchingQuality {
                    dimensions,
                    low,
                    high,
                    best,
                    steps: steps + 1,
                })
            }
            SearchState::ReducingDimensions { from } => {
                let next = from.reduced();
                if self.reductions >= MAX_REDUCTIONS || next.long_edge() < MIN_LONG_EDGE {
                    return Ok(SearchState::Unreachable { smallest: from });
                }
                self.reductions += 1;
                Ok(SearchState::searching(next))
            }
            terminal => Ok(terminal),
        }
    }

    /// Runs from `original` until `Success` or `Unreachable`
    pub fn run(&mut self, original: Dimensions) -> Result<SearchOutcome, E> {
        let mut state = SearchState::searching(original);
        while !state.is_terminal() {
            state = self.step(state)?;
        }
        Ok(match state {
            SearchState::Success(encoded) => SearchOutcome::Success(encoded),
            SearchState::Unreachable { smallest } => SearchOutcome::Unreachable { smallest },
            _ => SearchOutcome::Unreachable { smallest: original },
        })
    }
}
