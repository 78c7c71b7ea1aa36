//! The per-function analysis driver.
//!
//! Runs the analyses in their fixed order — hook preparation, a first
//! dataflow pass, hook installation, a second dataflow pass, signature
//! inference, structural analysis, liveness, variable reconstruction —
//! and packages the results for the emitter.  Every function is
//! self-contained: one bad function is logged and skipped, and only a
//! data-model invariant violation or a cancellation stops the whole run.

use log::{debug, error, warn};
use thiserror::Error;

use crate::common::cancel::{Cancelled, CancellationToken};
use crate::common::*;
use crate::front::arch::Architecture;
use crate::front::image::Image;
use crate::middle::cconv::{infer_signature, HookInstaller, Hooks, Signature, Signatures};
use crate::middle::cfg::Cfg;
use crate::middle::dataflow::{Dataflow, DataflowAnalyzer};
use crate::middle::ir::*;
use crate::middle::liveness::{Liveness, LivenessAnalyzer};
use crate::middle::structure::{RegionGraph, StructuralAnalyzer};
use crate::middle::vars::{self, Variables};

/// Knobs guarding the iterative analyses against pathological inputs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Options {
    /// Dataflow visits per basic block before widening.
    pub max_block_visits: u32,
    /// Structural reduction passes before giving up on a function.
    pub max_structural_passes: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_block_visits: 100,
            max_structural_passes: 1000,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum AnalysisError {
    /// Not a failure: the operator asked the run to stop.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    /// This function cannot be analyzed; others are unaffected.
    #[error("function at {addr}: {reason}")]
    FunctionFatal { addr: String, reason: String },
    /// A data-model invariant broke; the whole run must stop.
    #[error("invariant violation: {0}")]
    CoreFatal(String),
}

impl From<DomainMismatch> for AnalysisError {
    fn from(error: DomainMismatch) -> Self {
        AnalysisError::CoreFatal(error.to_string())
    }
}

/// Everything the analyses learned about one function.  This is the
/// emission contract: the region tree to traverse, the liveness set to
/// filter statements with, the variables to rename accesses through,
/// the dataflow to consult for values, and the hooks whose synthesized
/// statements the emitter hides.
#[derive(Debug)]
pub struct FunctionAnalysis {
    pub dataflow: Dataflow,
    pub hooks: Hooks,
    pub signature: Signature,
    pub regions: RegionGraph,
    pub liveness: Liveness,
    pub variables: Variables,
}

pub struct Driver<'a> {
    arch: &'a Architecture,
    image: Option<&'a Image>,
    options: Options,
    token: CancellationToken,
}

impl<'a> Driver<'a> {
    pub fn new(arch: &'a Architecture, image: Option<&'a Image>) -> Self {
        Self {
            arch,
            image,
            options: Options::default(),
            token: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Analyzes every function of the program in entry-address order.
    /// Signatures inferred for earlier functions benefit calls analyzed
    /// later.
    pub fn analyze_program(
        &self,
        program: &mut Program,
        signatures: &mut Signatures,
    ) -> Result<Map<FuncId, FunctionAnalysis>, AnalysisError> {
        let mut results = Map::new();
        for func in program.functions_by_addr() {
            match self.analyze_function(program, func, signatures) {
                Ok(analysis) => {
                    results.insert(func, analysis);
                }
                Err(AnalysisError::FunctionFatal { addr, reason }) => {
                    error!("skipping function at {addr}: {reason}");
                }
                Err(fatal) => return Err(fatal),
            }
        }
        Ok(results)
    }

    /// Runs the full pipeline on one function.
    pub fn analyze_function(
        &self,
        program: &mut Program,
        func: FuncId,
        signatures: &mut Signatures,
    ) -> Result<FunctionAnalysis, AnalysisError> {
        let function_fatal = |program: &Program, reason: String| AnalysisError::FunctionFatal {
            addr: format_addr(program.function(func).addr()),
            reason,
        };

        let Some(entry) = program.function(func).entry() else {
            return Err(function_fatal(program, "no entry block".to_owned()));
        };
        debug!(
            "analyzing function at {}",
            format_addr(program.function(func).addr())
        );

        let installer = HookInstaller::new(self.arch, signatures);
        let mut hooks = installer
            .prepare(program.function_mut(func))
            .map_err(|error| function_fatal(program, error.to_string()))?;

        let first_pass = self.run_dataflow(program, func)?;
        installer
            .install(program.function_mut(func), &mut hooks, &first_pass)
            .map_err(|error| function_fatal(program, error.to_string()))?;
        let dataflow = self.run_dataflow(program, func)?;

        let function = program.function(func);
        {
            // With indirect jumps resolved, anything still unreachable
            // is dead for real and stays out of the region tree.
            let cfg = Cfg::with_resolved_targets(function, dataflow.resolved_targets());
            let reachable = cfg.reachable(entry).len();
            let total = function.block_ids().count();
            if reachable < total {
                warn!(
                    "{}: {} of {} blocks are unreachable and will be dropped",
                    format_addr(function.addr()),
                    total - reachable,
                    total
                );
            }
        }
        let inferred = infer_signature(function, &hooks, &dataflow, self.arch);
        let signature = match signatures.for_function(function) {
            Some(signature) => signature.clone(),
            None => {
                if let Some(addr) = function.addr() {
                    signatures.set(addr, inferred.clone());
                }
                inferred
            }
        };

        let regions = StructuralAnalyzer::new(function, &dataflow, self.token.clone())
            .with_max_passes(self.options.max_structural_passes)
            .analyze()?;
        let liveness = LivenessAnalyzer::new(
            function,
            &dataflow,
            &regions,
            &hooks,
            &signature,
            signatures,
            self.arch,
            self.token.clone(),
        )
        .analyze()?;
        let variables = vars::reconstruct(function, &dataflow, &liveness, self.arch)?;

        Ok(FunctionAnalysis {
            dataflow,
            hooks,
            signature,
            regions,
            liveness,
            variables,
        })
    }

    fn run_dataflow(&self, program: &Program, func: FuncId) -> Result<Dataflow, Cancelled> {
        DataflowAnalyzer::new(program, func, self.arch, self.image, self.token.clone())
            .with_max_block_visits(self.options.max_block_visits)
            .analyze()
    }
}
