//! Equivalence Oracle
//!
//! Runs several programs over the same inputs and demands identical return
//! values, optionally also against a [`Reference`] evaluation of the policy
//! they were compiled from. Coverage is accumulated per program so that a
//! corpus which never reaches part of an optimized program is caught.

extern crate alloc;

mod corpus;
mod reference;

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

pub use corpus::{Corpus, MAX_CROSS_PRODUCT};
pub use reference::Reference;
use thiserror::Error;

use crate::bytecode::program::Program;
use crate::execution::{ExecError, Interpreter, SeccompExecutor, SyscallInput};

/// Errors reported by the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("no programs to compare")]
    NoPrograms,

    #[error("{input}: {baseline} returned {expected:#x}, {program} returned {actual:#x}")]
    Mismatch {
        input: SyscallInput,
        baseline: String,
        expected: u32,
        program: String,
        actual: u32,
    },

    #[error("{program} failed on {input}")]
    Execution {
        program: String,
        input: SyscallInput,
        #[source]
        source: ExecError,
    },

    #[error("{program}: instructions {uncovered:?} never executed")]
    MissingCoverage { program: String, uncovered: Vec<usize> },
}

/// A program under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fuzzee {
    pub name: String,
    pub program: Program,
    /// Fail [`Oracle::finish`] if any instruction stays unexecuted.
    pub enforce_full_coverage: bool,
}

impl Fuzzee {
    pub fn new(name: impl Into<String>, program: Program) -> Self {
        Self {
            name: name.into(),
            program,
            enforce_full_coverage: false,
        }
    }

    pub fn with_full_coverage(mut self) -> Self {
        self.enforce_full_coverage = true;
        self
    }
}

/// Coverage of one program after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramCoverage {
    pub name: String,
    pub covered: usize,
    pub total: usize,
}

/// Summary returned by [`Oracle::finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageReport {
    pub inputs: usize,
    pub programs: Vec<ProgramCoverage>,
}

/// Differential executor over a set of programs.
#[derive(Debug, Clone)]
pub struct Oracle {
    fuzzees: Vec<Fuzzee>,
    reference: Option<Reference>,
    coverage: Vec<Vec<bool>>,
    inputs: usize,
    interpreter: Interpreter,
}

impl Oracle {
    pub fn new(fuzzees: Vec<Fuzzee>) -> Self {
        let coverage = fuzzees
            .iter()
            .map(|fuzzee| vec![false; fuzzee.program.insn_count()])
            .collect();
        Self {
            fuzzees,
            reference: None,
            coverage,
            inputs: 0,
            interpreter: Interpreter::new(),
        }
    }

    /// Also compare every result with the policy's own verdict.
    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Run every program on `input`, returning the agreed value.
    pub fn check(&mut self, input: &SyscallInput) -> Result<u32, OracleError> {
        if self.fuzzees.is_empty() {
            return Err(OracleError::NoPrograms);
        }
        let verdict = self.reference.as_ref().map(|r| r.evaluate(input).to_raw());
        let (baseline, expected, first) = match verdict {
            Some(value) => (String::from("reference"), value, 0),
            None => (self.fuzzees[0].name.clone(), self.execute(0, input)?, 1),
        };

        for idx in first..self.fuzzees.len() {
            let actual = self.execute(idx, input)?;
            if actual != expected {
                return Err(OracleError::Mismatch {
                    input: *input,
                    baseline,
                    expected,
                    program: self.fuzzees[idx].name.clone(),
                    actual,
                });
            }
        }
        self.inputs += 1;
        Ok(expected)
    }

    /// Check every input of `corpus`, then [`finish`](Self::finish).
    pub fn run(mut self, corpus: &Corpus) -> Result<CoverageReport, OracleError> {
        for input in corpus.iter() {
            self.check(input)?;
        }
        self.finish()
    }

    /// Enforce coverage requirements and report.
    pub fn finish(self) -> Result<CoverageReport, OracleError> {
        let mut programs = Vec::with_capacity(self.fuzzees.len());
        for (fuzzee, covered) in self.fuzzees.into_iter().zip(self.coverage) {
            let uncovered: Vec<usize> = covered
                .iter()
                .enumerate()
                .filter(|&(_, &hit)| !hit)
                .map(|(idx, _)| idx)
                .collect();
            if fuzzee.enforce_full_coverage && !uncovered.is_empty() {
                return Err(OracleError::MissingCoverage {
                    program: fuzzee.name,
                    uncovered,
                });
            }
            programs.push(ProgramCoverage {
                name: fuzzee.name,
                covered: covered.len() - uncovered.len(),
                total: covered.len(),
            });
        }
        Ok(CoverageReport {
            inputs: self.inputs,
            programs,
        })
    }

    fn execute(&mut self, idx: usize, input: &SyscallInput) -> Result<u32, OracleError> {
        let fuzzee = &self.fuzzees[idx];
        let metrics = self
            .interpreter
            .execute_with_metrics(&fuzzee.program, input)
            .map_err(|source| OracleError::Execution {
                program: fuzzee.name.clone(),
                input: *input,
                source,
            })?;
        for (seen, hit) in self.coverage[idx].iter_mut().zip(metrics.coverage) {
            *seen |= hit;
        }
        Ok(metrics.return_value)
    }
}
