//! Job evaluation over encrypted tables.
//!
//! The engine drives a [`LatticeBackend`] through a fixed repertoire of
//! aggregation circuits. Filters are approximate: comparisons against a
//! literal are evaluated with pinned polynomial kernels (sign iteration for
//! orderings, repeated squaring for categorical equality), producing a
//! 0/1-valued mask ciphertext that multiplies the target column. Slot
//! reductions use rotate-and-add over power-of-two steps, then a unit mask
//! so only slot 0 of the result carries the aggregate.
//!
//! Before touching any ciphertext the engine computes the multiplicative
//! depth of the planned circuit. On profiles without bootstrapping a plan
//! deeper than the modulus chain fails up front with `DepthBudgetExceeded`
//! and no result artifact is written. On bootstrapping profiles the engine
//! refreshes operands whenever their remaining level drops below a
//! watermark.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{debug, info, warn};

use cipherstat_he::{Ciphertext, EvalKeys, HeError, HeResult, LatticeBackend, Plaintext};

use crate::codec::SchemaCodec;
use crate::error::{PipelineError, PipelineResult};
use crate::jobs::{Comparator, Condition, Job, JobState, Operation};
use crate::result::JobResult;
use crate::schema::{Column, ColumnType};
use crate::table::TableStore;

/// Version tag of the comparator kernel constants below. Bump when any of
/// them changes; results produced under different versions are not
/// comparable bit-for-bit.
pub const COMPARATOR_VERSION: u32 = 1;

/// Iterations of `s <- 1.5s - 0.5s^3` used to sharpen an ordering sign.
pub const SIGN_ITERS: usize = 15;

/// Squarings applied to `1 - u^2` for categorical equality masks.
pub const EQ_SQUARINGS: u32 = 6;

/// Newton iterations of `y <- y(2 - x*y)` for the encrypted reciprocal in
/// filtered averages.
pub const RECIP_ITERS: usize = 3;

/// Refresh operands below this level before multiplying, on profiles that
/// can bootstrap.
const BOOTSTRAP_WATERMARK: usize = 2;

// Multiplicative depth of each kernel, matching the circuits below.
const ORD_MASK_DEPTH: usize = 2 + 3 * SIGN_ITERS;
const EQ_POLY_DEPTH: usize = 2 + EQ_SQUARINGS as usize;
const RECIP_DEPTH: usize = 3 + 2 * RECIP_ITERS;

/// How one condition is evaluated against its column ciphertext.
enum MaskKernel {
    /// Categorical equality: `(1 - ((x - v)/span)^2)` squared
    /// `EQ_SQUARINGS` times.
    Equality {
        literal: f64,
        span: f64,
        negate: bool,
    },
    /// Ordering mask via sign iteration on `(sign*x + offset)/span`.
    Ordering { sign: f64, offset: f64, span: f64 },
    /// Numeric equality as the product of the two inclusive orderings
    /// around the literal.
    OrderedEquality {
        literal: f64,
        step: f64,
        span: f64,
        negate: bool,
    },
}

impl MaskKernel {
    fn depth(&self) -> usize {
        match self {
            MaskKernel::Equality { .. } => EQ_POLY_DEPTH,
            MaskKernel::Ordering { .. } => ORD_MASK_DEPTH,
            MaskKernel::OrderedEquality { .. } => ORD_MASK_DEPTH + 1,
        }
    }
}

struct ResolvedCondition {
    column: String,
    kernel: MaskKernel,
}

struct ResolvedJob {
    target: Option<String>,
    conditions: Vec<ResolvedCondition>,
    plan_depth: usize,
}

pub struct JobEngine<'a> {
    backend: &'a dyn LatticeBackend,
    eval: &'a EvalKeys,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> JobEngine<'a> {
    pub fn new(backend: &'a dyn LatticeBackend, eval: &'a EvalKeys) -> PipelineResult<Self> {
        let profile = backend.profile();
        if eval.profile != profile.id {
            return Err(PipelineError::He(HeError::profile_mismatch(
                profile.id,
                eval.profile,
                "evaluation keys handed to engine",
            )));
        }
        Ok(Self {
            backend,
            eval,
            cancel: None,
        })
    }

    /// Cooperative cancellation: the flag is polled between blocks and
    /// between kernel iterations, and aborts the run with `Cancelled`.
    pub fn with_cancellation(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Evaluate `job` against `store` and return the encrypted result.
    pub fn run(&self, job: &Job, store: &TableStore) -> PipelineResult<JobResult> {
        self.transition(job, &JobState::Resolve);
        let resolved = self.phase(job, "resolve", || self.resolve(job, store))?;
        debug!(
            job = %job.id,
            plan_depth = resolved.plan_depth,
            comparator_version = COMPARATOR_VERSION,
            "resolved job plan"
        );

        self.transition(job, &JobState::Evaluate);
        let ciphertext = self.phase(job, "evaluate", || self.evaluate(job, store, &resolved))?;

        self.transition(job, &JobState::Finalize);
        let metadata = store.metadata();
        let result = JobResult {
            job_id: job.id.clone(),
            operation: job.operation,
            profile: metadata.profile.clone(),
            params_hash: metadata.params_hash.clone(),
            rows: metadata.rows,
            created_at: Utc::now(),
            ciphertext,
        };
        self.transition(job, &JobState::Done);
        Ok(result)
    }

    /// [`run`](Self::run), then persist the result atomically. Nothing is
    /// written when any phase fails.
    pub fn run_to_file(
        &self,
        job: &Job,
        store: &TableStore,
        out: &Path,
    ) -> PipelineResult<JobResult> {
        let result = self.run(job, store)?;
        result.save(out)?;
        info!(job = %job.id, out = %out.display(), "wrote encrypted result");
        Ok(result)
    }

    fn phase<T>(
        &self,
        job: &Job,
        phase: &'static str,
        f: impl FnOnce() -> PipelineResult<T>,
    ) -> PipelineResult<T> {
        f().map_err(|e| {
            warn!(job = %job.id, state = %JobState::Failed { phase }, error = %e, "job failed");
            e
        })
    }

    fn transition(&self, job: &Job, state: &JobState) {
        info!(job = %job.id, state = %state, "job state");
    }

    fn check_cancelled(&self) -> PipelineResult<()> {
        if let Some(flag) = self.cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(PipelineError::Cancelled);
            }
        }
        Ok(())
    }

    // ---- resolve ----------------------------------------------------------

    fn resolve(&self, job: &Job, store: &TableStore) -> PipelineResult<ResolvedJob> {
        let metadata = store.metadata();
        let table_profile = metadata.profile()?;
        let profile = self.backend.profile();
        if table_profile.id != profile.id {
            return Err(PipelineError::He(HeError::profile_mismatch(
                profile.id,
                table_profile.id,
                "table under evaluation",
            )));
        }
        if self.eval.key_id != metadata.key_id {
            return Err(PipelineError::He(HeError::SlotLayoutMismatch {
                reason: format!(
                    "evaluation keys {} do not match table key {}",
                    self.eval.key_id, metadata.key_id
                ),
            }));
        }

        let schema = &metadata.schema;
        let target = match (job.operation.needs_target(), &job.target_column) {
            (true, Some(name)) => {
                let column = schema.require_column(name)?;
                if column.ty == ColumnType::Categorical {
                    return Err(PipelineError::InvalidJob(format!(
                        "operation {} cannot aggregate categorical column {name:?}",
                        job.operation
                    )));
                }
                Some(name.clone())
            }
            _ => None,
        };

        let codec = SchemaCodec::new(profile);
        let conditions = job
            .conditions
            .iter()
            .map(|c| resolve_condition(&codec, store, c))
            .collect::<PipelineResult<Vec<_>>>()?;

        let plan_depth = plan_depth(job.operation, &conditions);
        if !profile.bootstrap && plan_depth > profile.max_level() {
            return Err(PipelineError::He(HeError::DepthBudgetExceeded {
                needed: plan_depth,
                available: profile.max_level(),
            }));
        }
        Ok(ResolvedJob {
            target,
            conditions,
            plan_depth,
        })
    }

    // ---- evaluate ---------------------------------------------------------

    fn evaluate(
        &self,
        job: &Job,
        store: &TableStore,
        resolved: &ResolvedJob,
    ) -> PipelineResult<Ciphertext> {
        let metadata = store.metadata();
        let rows = metadata.rows as f64;
        let block_count = metadata.block_count;

        let target_blocks = match &resolved.target {
            Some(name) => Some(store.load_column(name)?),
            None => None,
        };
        let needs_validity = matches!(
            job.operation,
            Operation::Count | Operation::FilterCount | Operation::FilterAvg
        );
        let validity_blocks = if needs_validity {
            Some(store.load_validity()?)
        } else {
            None
        };
        let mut condition_blocks: HashMap<&str, Vec<Ciphertext>> = HashMap::new();
        for cond in &resolved.conditions {
            if !condition_blocks.contains_key(cond.column.as_str()) {
                condition_blocks.insert(cond.column.as_str(), store.load_column(&cond.column)?);
            }
        }

        // Per-block partial aggregates, then one add-chain across blocks.
        let mut primary: Option<Ciphertext> = None;
        let mut secondary: Option<Ciphertext> = None;
        for block in 0..block_count {
            self.check_cancelled()?;
            let mask = self.combined_mask(resolved, &condition_blocks, block)?;
            let (p, s) = self.block_partials(
                job.operation,
                target_blocks.as_deref(),
                validity_blocks.as_deref(),
                mask,
                block,
            )?;
            primary = Some(self.accumulate(primary, p)?);
            secondary = match (secondary, s) {
                (acc, Some(s)) => Some(self.accumulate(acc, s)?),
                (acc, None) => acc,
            };
            debug!(job = %job.id, block, "evaluated block");
        }
        let primary = primary.ok_or_else(|| {
            PipelineError::InvalidTable("table has no ciphertext blocks".to_string())
        })?;

        let primary = self.reduce(primary)?;
        match job.operation {
            Operation::Sum | Operation::Count | Operation::FilterSum | Operation::FilterCount => {
                Ok(primary)
            }
            Operation::Avg => Ok(self.mul_scalar(primary, 1.0 / rows)?),
            Operation::Var | Operation::Stdev => {
                // primary = sum(x), secondary = sum(x^2). Stdev ships the
                // variance ciphertext; the square root happens after
                // decryption.
                let sum_sq = self.reduce(self.required(secondary)?)?;
                let ex2 = self.mul_scalar(sum_sq, 1.0 / rows)?;
                let mean = self.mul_scalar(primary, 1.0 / rows)?;
                let mean_sq = self.mul(mean.clone(), mean)?;
                Ok(self.backend.sub(&ex2, &mean_sq)?)
            }
            Operation::FilterAvg => {
                // primary = masked sum, secondary = masked count.
                let count = self.reduce(self.required(secondary)?)?;
                let inv = self.reciprocal(count, rows)?;
                let avg = self.mul(primary, inv)?;
                Ok(self.mul_scalar(avg, 1.0 / rows)?)
            }
        }
    }

    fn required(&self, ct: Option<Ciphertext>) -> PipelineResult<Ciphertext> {
        ct.ok_or_else(|| {
            PipelineError::InvalidTable("missing secondary accumulator".to_string())
        })
    }

    /// The per-block contributions of one operation: the value accumulator
    /// and, for var / filtered averages, a second accumulator.
    fn block_partials(
        &self,
        operation: Operation,
        targets: Option<&[Ciphertext]>,
        validity: Option<&[Ciphertext]>,
        mask: Option<Ciphertext>,
        block: usize,
    ) -> PipelineResult<(Ciphertext, Option<Ciphertext>)> {
        let target = targets.map(|t| &t[block]);
        let valid = validity.map(|v| &v[block]);
        match operation {
            Operation::Sum | Operation::Avg => Ok((self.some_target(target)?.clone(), None)),
            Operation::Count => Ok((self.some_target(valid)?.clone(), None)),
            Operation::Var | Operation::Stdev => {
                let t = self.some_target(target)?;
                let sq = self.mul(t.clone(), t.clone())?;
                Ok((t.clone(), Some(sq)))
            }
            Operation::FilterSum => {
                let mask = self.some_mask(mask)?;
                Ok((self.mul(mask, self.some_target(target)?.clone())?, None))
            }
            Operation::FilterCount => {
                let mask = self.some_mask(mask)?;
                Ok((self.mul(mask, self.some_target(valid)?.clone())?, None))
            }
            Operation::FilterAvg => {
                let mask = self.some_mask(mask)?;
                let masked_sum = self.mul(mask.clone(), self.some_target(target)?.clone())?;
                let masked_count = self.mul(mask, self.some_target(valid)?.clone())?;
                Ok((masked_sum, Some(masked_count)))
            }
        }
    }

    fn some_target<'c>(&self, ct: Option<&'c Ciphertext>) -> PipelineResult<&'c Ciphertext> {
        ct.ok_or_else(|| PipelineError::InvalidTable("operand blocks not loaded".to_string()))
    }

    fn some_mask(&self, mask: Option<Ciphertext>) -> PipelineResult<Ciphertext> {
        mask.ok_or_else(|| {
            PipelineError::InvalidJob("filtered operation resolved no conditions".to_string())
        })
    }

    fn accumulate(
        &self,
        acc: Option<Ciphertext>,
        ct: Ciphertext,
    ) -> PipelineResult<Ciphertext> {
        match acc {
            Some(acc) => Ok(self.backend.add(&acc, &ct)?),
            None => Ok(ct),
        }
    }

    /// AND of all condition masks for one block, or `None` when the job is
    /// unfiltered.
    fn combined_mask(
        &self,
        resolved: &ResolvedJob,
        condition_blocks: &HashMap<&str, Vec<Ciphertext>>,
        block: usize,
    ) -> PipelineResult<Option<Ciphertext>> {
        let mut combined: Option<Ciphertext> = None;
        for cond in &resolved.conditions {
            let column_ct = &condition_blocks[cond.column.as_str()][block];
            let mask = self.condition_mask(&cond.kernel, column_ct)?;
            combined = Some(match combined {
                Some(acc) => self.mul(acc, mask)?,
                None => mask,
            });
        }
        Ok(combined)
    }

    fn condition_mask(&self, kernel: &MaskKernel, x: &Ciphertext) -> PipelineResult<Ciphertext> {
        match kernel {
            MaskKernel::Equality {
                literal,
                span,
                negate,
            } => {
                let mask = self.equality_mask(x, *literal, *span)?;
                if *negate {
                    Ok(self.complement(mask)?)
                } else {
                    Ok(mask)
                }
            }
            MaskKernel::Ordering { sign, offset, span } => {
                self.ordering_mask(x, *sign, *offset, *span)
            }
            MaskKernel::OrderedEquality {
                literal,
                step,
                span,
                negate,
            } => {
                let ge = self.ordering_mask(x, 1.0, -literal + step / 2.0, *span)?;
                let le = self.ordering_mask(x, -1.0, literal + step / 2.0, *span)?;
                let eq = self.mul(ge, le)?;
                if *negate {
                    Ok(self.complement(eq)?)
                } else {
                    Ok(eq)
                }
            }
        }
    }

    /// `(sgn((sign*x + offset)/span) + 1) / 2`, with the sign sharpened by
    /// `SIGN_ITERS` cubic iterations.
    fn ordering_mask(
        &self,
        x: &Ciphertext,
        sign: f64,
        offset: f64,
        span: f64,
    ) -> PipelineResult<Ciphertext> {
        let mut s = self.mul_scalar(x.clone(), sign / span)?;
        s = self.backend.add_scalar(&s, offset / span)?;
        for _ in 0..SIGN_ITERS {
            self.check_cancelled()?;
            let s2 = self.mul(s.clone(), s.clone())?;
            let s3 = self.mul(s2, s.clone())?;
            let a = self.mul_scalar(s, 1.5)?;
            let b = self.mul_scalar(s3, 0.5)?;
            s = self.backend.sub(&a, &b)?;
        }
        let shifted = self.backend.add_scalar(&s, 1.0)?;
        Ok(self.mul_scalar(shifted, 0.5)?)
    }

    /// `(1 - ((x - v)/span)^2)` squared `EQ_SQUARINGS` times; approaches 1
    /// at `x = v` and 0 elsewhere for the small spans of categorical codes.
    fn equality_mask(&self, x: &Ciphertext, literal: f64, span: f64) -> PipelineResult<Ciphertext> {
        let u = self.mul_scalar(x.clone(), 1.0 / span)?;
        let u = self.backend.add_scalar(&u, -literal / span)?;
        let u2 = self.mul(u.clone(), u)?;
        let mut t = self.backend.add_scalar(&self.backend.negate(&u2)?, 1.0)?;
        for _ in 0..EQ_SQUARINGS {
            self.check_cancelled()?;
            t = self.mul(t.clone(), t)?;
        }
        Ok(t)
    }

    fn complement(&self, mask: Ciphertext) -> HeResult<Ciphertext> {
        self.backend.add_scalar(&self.backend.negate(&mask)?, 1.0)
    }

    /// Rotate-and-add over power-of-two steps, then a unit mask so only
    /// slot 0 carries the total.
    fn reduce(&self, ct: Ciphertext) -> PipelineResult<Ciphertext> {
        let profile = self.backend.profile();
        let mut acc = ct;
        for step in profile.rotation_steps() {
            self.check_cancelled()?;
            let rotated = self.backend.rotate(&acc, step, self.eval)?;
            acc = self.backend.add(&acc, &rotated)?;
        }
        let mut unit = vec![0.0; profile.slots];
        unit[0] = 1.0;
        Ok(self.mul_plain(acc, Plaintext::new(profile.id, unit))?)
    }

    /// Newton reciprocal of `count`, scaled so the iteration operates on
    /// `count/rows` inside the unit interval. The returned ciphertext
    /// approximates `rows/count` in slot 0.
    fn reciprocal(&self, count: Ciphertext, rows: f64) -> PipelineResult<Ciphertext> {
        let x = self.mul_scalar(count, 1.0 / rows)?;
        let mut y = self.backend.add_scalar(&self.backend.negate(&x)?, 2.0)?;
        for _ in 0..RECIP_ITERS {
            self.check_cancelled()?;
            let xy = self.mul(x.clone(), y.clone())?;
            let inner = self.backend.add_scalar(&self.backend.negate(&xy)?, 2.0)?;
            y = self.mul(y, inner)?;
        }
        Ok(y)
    }

    // ---- leveled multiplication helpers -----------------------------------

    fn refreshed(&self, ct: Ciphertext) -> HeResult<Ciphertext> {
        if self.backend.profile().bootstrap && ct.level < BOOTSTRAP_WATERMARK {
            self.backend.bootstrap(&ct)
        } else {
            Ok(ct)
        }
    }

    fn mul(&self, a: Ciphertext, b: Ciphertext) -> HeResult<Ciphertext> {
        let a = self.refreshed(a)?;
        let b = self.refreshed(b)?;
        self.backend.mul(&a, &b, self.eval)
    }

    fn mul_plain(&self, a: Ciphertext, pt: Plaintext) -> HeResult<Ciphertext> {
        let a = self.refreshed(a)?;
        self.backend.mul_plain(&a, &pt)
    }

    fn mul_scalar(&self, a: Ciphertext, value: f64) -> HeResult<Ciphertext> {
        let a = self.refreshed(a)?;
        self.backend.mul_scalar(&a, value)
    }
}

fn resolve_condition(
    codec: &SchemaCodec<'_>,
    store: &TableStore,
    condition: &Condition,
) -> PipelineResult<ResolvedCondition> {
    let metadata = store.metadata();
    let column = metadata.schema.require_column(&condition.column)?;
    let dictionary = metadata.dictionary(&condition.column);
    let literal = codec.encode_literal(column, dictionary, &condition.value)?;

    let kernel = match column.ty {
        ColumnType::Categorical => {
            if !condition.comparator.is_equality() {
                return Err(PipelineError::InvalidJob(format!(
                    "comparator {} is not defined on categorical column {:?}",
                    condition.comparator, condition.column
                )));
            }
            // Codes run 1..=len with 0 reserved for padding, so len + 1
            // bounds every pairwise distance.
            let span = dictionary.map(|d| d.len()).unwrap_or(0) as f64 + 1.0;
            MaskKernel::Equality {
                literal,
                span,
                negate: condition.comparator == Comparator::Ne,
            }
        }
        ColumnType::Integer | ColumnType::FixedPoint => {
            let step = column.step();
            let span = declared_span(column)? + step;
            match condition.comparator {
                Comparator::Eq | Comparator::Ne => MaskKernel::OrderedEquality {
                    literal,
                    step,
                    span,
                    negate: condition.comparator == Comparator::Ne,
                },
                Comparator::Ge => ordering(1.0, -literal + step / 2.0, span),
                Comparator::Gt => ordering(1.0, -literal - step / 2.0, span),
                Comparator::Le => ordering(-1.0, literal + step / 2.0, span),
                Comparator::Lt => ordering(-1.0, literal - step / 2.0, span),
            }
        }
    };
    Ok(ResolvedCondition {
        column: condition.column.clone(),
        kernel,
    })
}

fn ordering(sign: f64, offset: f64, span: f64) -> MaskKernel {
    MaskKernel::Ordering { sign, offset, span }
}

fn declared_span(column: &Column) -> PipelineResult<f64> {
    column.span().ok_or_else(|| {
        PipelineError::InvalidJob(format!(
            "column {:?} declares no value range, required for comparisons",
            column.name
        ))
    })
}

/// Multiplicative depth of the planned circuit, pinned to the kernels above.
fn plan_depth(operation: Operation, conditions: &[ResolvedCondition]) -> usize {
    let mask_depth = conditions
        .iter()
        .map(|c| c.kernel.depth())
        .max()
        .map(|deepest| deepest + conditions.len().saturating_sub(1));
    match operation {
        Operation::Sum | Operation::Count => 1,
        Operation::Avg => 2,
        Operation::Var | Operation::Stdev => 4,
        Operation::FilterSum | Operation::FilterCount => mask_depth.unwrap_or(0) + 2,
        Operation::FilterAvg => mask_depth.unwrap_or(0) + 2 + RECIP_DEPTH,
    }
}
