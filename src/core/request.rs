//! Request tracking for in-flight batching.
//!
//! A [`Request`] is the state machine for a single inference request:
//!
//! ```text
//! Queued -> Context -> Generation -> Completed
//!    ^                     |
//!    |                     v
//!    +------ front <--- Paused        Cancelled (from any non-terminal)
//! ```
//!
//! A paused request was evicted from active execution under memory pressure;
//! it resumes by re-entering the context phase over its prompt plus the
//! tokens it already generated, so no emitted output is ever lost.

use crate::error::{Error, Result};

/// Unique identifier for a request.
///
/// Never reused while the request is active; reusable only after a final
/// response has been delivered for it.
pub type RequestId = u64;

/// Phase of a request in the batch manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestPhase {
    /// Waiting in the pending queue for admission.
    Queued,
    /// Processing its full prompt (or recomputed prefix after a pause).
    Context,
    /// Autoregressive decoding, one token per beam per iteration.
    Generation,
    /// Admitted but evicted from execution under memory pressure.
    Paused,
    /// Finished generation (stop token or max length). Terminal.
    Completed,
    /// Torn down via stop signal. Terminal.
    Cancelled,
}

impl RequestPhase {
    /// Check if the request occupies a slot in the active batch.
    pub fn is_executing(&self) -> bool {
        matches!(self, Self::Context | Self::Generation)
    }

    /// Check if the phase is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Get the phase name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Context => "Context",
            Self::Generation => "Generation",
            Self::Paused => "Paused",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// Reason a request reached a terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// A stop token was generated.
    StopToken,
    /// Maximum output length reached.
    MaxTokens,
    /// Cancelled via stop signal.
    Cancelled,
    /// Failed with an unrecoverable error.
    Error,
}

/// Generation parameters carried by each intake entry.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate per beam.
    pub max_new_tokens: usize,
    /// Number of parallel hypotheses (>= 1).
    pub beam_width: usize,
    /// Deliver partial output every iteration instead of only at the end.
    pub streaming: bool,
    /// Tokens that terminate generation.
    pub stop_tokens: Vec<u32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            beam_width: 1,
            streaming: false,
            stop_tokens: Vec::new(),
        }
    }
}

/// A single inference request.
///
/// Owned exclusively by the batch manager for its lifetime; the scheduler
/// and cache manager refer to it by ID only.
///
/// # Example
///
/// ```
/// use inflight::core::request::{GenerationParams, Request, RequestPhase};
///
/// let mut req = Request::new(1, vec![1, 2, 3, 4], GenerationParams::default());
/// assert_eq!(req.phase(), RequestPhase::Queued);
/// assert_eq!(req.prompt_len(), 4);
///
/// req.set_context().unwrap();
/// req.set_generation().unwrap();
/// req.append_beam_token(0, 5).unwrap();
/// assert_eq!(req.output_len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    /// Unique request identifier.
    request_id: RequestId,
    /// Prompt token IDs.
    prompt_token_ids: Vec<u32>,
    /// Generation parameters.
    params: GenerationParams,
    /// Generated output token IDs, one list per beam.
    beam_outputs: Vec<Vec<u32>>,
    /// Current phase.
    phase: RequestPhase,
    /// Reason for finishing (if terminal).
    finish_reason: Option<FinishReason>,
    /// Number of times this request was paused and resumed.
    pause_count: usize,
}

impl Request {
    /// Create a new queued request.
    ///
    /// The beam width is clamped to at least 1.
    pub fn new(request_id: RequestId, prompt_token_ids: Vec<u32>, params: GenerationParams) -> Self {
        let beam_width = params.beam_width.max(1);
        Self {
            request_id,
            prompt_token_ids,
            params: GenerationParams {
                beam_width,
                ..params
            },
            beam_outputs: vec![Vec::new(); beam_width],
            phase: RequestPhase::Queued,
            finish_reason: None,
            pause_count: 0,
        }
    }

    // ========== Getters ==========

    /// Get the request ID.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Get the prompt token IDs.
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    /// Get the generation parameters.
    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// Get the beam width.
    pub fn beam_width(&self) -> usize {
        self.params.beam_width
    }

    /// Get the output tokens of one beam.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BeamIndexOutOfBounds`] for an invalid beam index.
    pub fn beam_output(&self, beam: usize) -> Result<&[u32]> {
        self.beam_outputs
            .get(beam)
            .map(Vec::as_slice)
            .ok_or(Error::BeamIndexOutOfBounds {
                request_id: self.request_id,
                beam,
                beam_width: self.params.beam_width,
            })
    }

    /// Get the output tokens of every beam.
    pub fn beam_outputs(&self) -> &[Vec<u32>] {
        &self.beam_outputs
    }

    /// Get the current phase.
    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    /// Get the finish reason (if terminal).
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Number of times this request has been paused.
    pub fn pause_count(&self) -> usize {
        self.pause_count
    }

    // ========== Length queries ==========

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Get the output length (tokens generated per beam).
    ///
    /// All beams advance in lockstep, one token per iteration.
    pub fn output_len(&self) -> usize {
        self.beam_outputs.first().map_or(0, Vec::len)
    }

    /// Tokens the context phase must process: the prompt, plus any output
    /// already generated before a pause.
    pub fn context_len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    /// Full token sequence of one beam (prompt + output), used when the
    /// context must be recomputed after a pause.
    pub fn beam_token_ids(&self, beam: usize) -> Result<Vec<u32>> {
        let output = self.beam_output(beam)?;
        let mut tokens = self.prompt_token_ids.clone();
        tokens.extend_from_slice(output);
        Ok(tokens)
    }

    /// Check whether the output budget is exhausted.
    pub fn reached_max_tokens(&self) -> bool {
        self.output_len() >= self.params.max_new_tokens
    }

    /// Check whether a token terminates generation.
    pub fn is_stop_token(&self, token_id: u32) -> bool {
        self.params.stop_tokens.contains(&token_id)
    }

    // ========== Token operations ==========

    /// Append a generated token to one beam.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BeamIndexOutOfBounds`] for an invalid beam index.
    pub fn append_beam_token(&mut self, beam: usize, token_id: u32) -> Result<()> {
        let beam_width = self.params.beam_width;
        let request_id = self.request_id;
        self.beam_outputs
            .get_mut(beam)
            .ok_or(Error::BeamIndexOutOfBounds {
                request_id,
                beam,
                beam_width,
            })?
            .push(token_id);
        Ok(())
    }

    /// Replace all beam outputs after a resampling step.
    ///
    /// `sources[i]` names the beam whose output history beam `i` continues
    /// from. Used together with beam branching in the cache manager.
    pub fn resample_beams(&mut self, sources: &[usize]) -> Result<()> {
        for &src in sources {
            if src >= self.beam_outputs.len() {
                return Err(Error::BeamIndexOutOfBounds {
                    request_id: self.request_id,
                    beam: src,
                    beam_width: self.params.beam_width,
                });
            }
        }
        self.beam_outputs = sources
            .iter()
            .map(|&src| self.beam_outputs[src].clone())
            .collect();
        Ok(())
    }

    // ========== Phase transitions ==========

    /// Transition into the context phase (admission or resume).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless the request is
    /// queued or paused.
    pub fn set_context(&mut self) -> Result<()> {
        match self.phase {
            RequestPhase::Queued => {
                self.phase = RequestPhase::Context;
                Ok(())
            }
            RequestPhase::Paused => {
                self.phase = RequestPhase::Context;
                self.pause_count += 1;
                Ok(())
            }
            _ => Err(self.bad_transition("Context")),
        }
    }

    /// Transition from context to generation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless the request is in
    /// the context phase.
    pub fn set_generation(&mut self) -> Result<()> {
        match self.phase {
            RequestPhase::Context => {
                self.phase = RequestPhase::Generation;
                Ok(())
            }
            _ => Err(self.bad_transition("Generation")),
        }
    }

    /// Pause an executing request (memory pressure).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless the request is
    /// executing.
    pub fn set_paused(&mut self) -> Result<()> {
        if self.phase.is_executing() {
            self.phase = RequestPhase::Paused;
            Ok(())
        } else {
            Err(self.bad_transition("Paused"))
        }
    }

    /// Mark the request completed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if already terminal.
    pub fn set_completed(&mut self, reason: FinishReason) -> Result<()> {
        if self.phase.is_terminal() {
            return Err(self.bad_transition("Completed"));
        }
        self.phase = RequestPhase::Completed;
        self.finish_reason = Some(reason);
        Ok(())
    }

    /// Cancel the request. Reachable from any non-terminal phase.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if already terminal.
    pub fn set_cancelled(&mut self) -> Result<()> {
        if self.phase.is_terminal() {
            return Err(self.bad_transition("Cancelled"));
        }
        self.phase = RequestPhase::Cancelled;
        self.finish_reason = Some(FinishReason::Cancelled);
        Ok(())
    }

    fn bad_transition(&self, to: &'static str) -> Error {
        Error::InvalidStateTransition {
            from: self.phase.as_str(),
            to,
        }
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
    }
}

impl Eq for Request {}
