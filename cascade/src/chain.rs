//! Chains: a stage pipeline plus the bookkeeping needed to track it across
//! the cluster.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::{ChainId, InputLayerId, PartitionId, SubmissionId};
use crate::value::{Record, Value};

/// Longest pipeline a chain may carry.
pub const MAX_STAGES: usize = 16;

#[derive(Debug, Error)]
pub enum ChainError {
    /// The pipeline already holds [`MAX_STAGES`] stages.
    #[error("pipeline is full ({max} stages)")]
    PipelineFull { max: usize },
    /// Stage parameters could not be serialized.
    #[error("failed to serialize stage parameters: {0}")]
    Params(#[from] postcard::Error),
}

/// One pipeline entry: the stage to run and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    name: String,
    params: Vec<Value>,
    /// Serialized size of `params` in bytes.
    raw_size: u32,
}

impl StageSpec {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    #[must_use]
    pub const fn raw_size(&self) -> u32 {
        self.raw_size
    }
}

/// A unit of work.
///
/// Exactly one thread owns a chain from the moment it is dequeued until its
/// activation ends; chains move between threads and nodes by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    id: ChainId,
    parent: Option<ChainId>,
    submission: SubmissionId,
    submission_node: PartitionId,
    input_layer: InputLayerId,
    input: Record,
    replication_factor: u32,
    children: u32,
    exclude_execution: bool,
    destination: Option<PartitionId>,
    stages: Vec<StageSpec>,
}

impl Chain {
    /// Creates an empty root chain for a submission owned by `submission_node`.
    #[must_use]
    pub fn new(id: ChainId, submission: SubmissionId, submission_node: PartitionId) -> Self {
        Self {
            id,
            parent: None,
            submission,
            submission_node,
            input_layer: InputLayerId::DEFAULT,
            input: Record::new(),
            replication_factor: 1,
            children: 0,
            exclude_execution: false,
            destination: None,
            stages: Vec::new(),
        }
    }

    /// Derives a child chain and counts it against this chain.
    ///
    /// The child inherits the submission, its owning node and the input layer;
    /// it starts with an empty pipeline and no destination.
    pub fn spawn_child(&mut self, id: ChainId) -> Self {
        self.children += 1;
        Self {
            id,
            parent: Some(self.id),
            submission: self.submission,
            submission_node: self.submission_node,
            input_layer: self.input_layer,
            input: Record::new(),
            replication_factor: 1,
            children: 0,
            exclude_execution: false,
            destination: None,
            stages: Vec::new(),
        }
    }

    /// Appends a stage to the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::PipelineFull`] past [`MAX_STAGES`] stages, or
    /// [`ChainError::Params`] if the parameters cannot be serialized.
    pub fn push_stage(
        &mut self,
        name: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<(), ChainError> {
        if self.stages.len() >= MAX_STAGES {
            return Err(ChainError::PipelineFull { max: MAX_STAGES });
        }
        let raw_size = postcard::to_allocvec(&params)?.len() as u32;
        self.stages.push(StageSpec {
            name: name.into(),
            params,
            raw_size,
        });
        Ok(())
    }

    /// Builder-style [`Chain::push_stage`].
    ///
    /// # Errors
    ///
    /// See [`Chain::push_stage`].
    pub fn with_stage(
        mut self,
        name: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<Self, ChainError> {
        self.push_stage(name, params)?;
        Ok(self)
    }

    #[must_use]
    pub const fn id(&self) -> ChainId {
        self.id
    }

    #[must_use]
    pub const fn parent(&self) -> Option<ChainId> {
        self.parent
    }

    #[must_use]
    pub const fn submission(&self) -> SubmissionId {
        self.submission
    }

    #[must_use]
    pub const fn submission_node(&self) -> PartitionId {
        self.submission_node
    }

    #[must_use]
    pub const fn input_layer(&self) -> InputLayerId {
        self.input_layer
    }

    #[must_use]
    pub const fn input(&self) -> &Record {
        &self.input
    }

    /// Sets the layer and query record the chain reads its input from.
    pub fn set_input(&mut self, layer: InputLayerId, query: Record) {
        self.input_layer = layer;
        self.input = query;
    }

    #[must_use]
    pub const fn replication_factor(&self) -> u32 {
        self.replication_factor
    }

    pub fn set_replication_factor(&mut self, factor: u32) {
        self.replication_factor = factor;
    }

    #[must_use]
    pub const fn children(&self) -> u32 {
        self.children
    }

    #[must_use]
    pub const fn exclude_execution(&self) -> bool {
        self.exclude_execution
    }

    /// When set, the stream loop sees end-of-stream immediately.
    pub fn set_exclude_execution(&mut self, exclude: bool) {
        self.exclude_execution = exclude;
    }

    #[must_use]
    pub const fn destination(&self) -> Option<PartitionId> {
        self.destination
    }

    pub fn set_destination(&mut self, node: PartitionId) {
        self.destination = Some(node);
    }

    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chain {} (submission {}, node {}) [",
            self.id, self.submission, self.submission_node
        )?;
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            f.write_str(&stage.name)?;
        }
        f.write_str("]")
    }
}

/// Compact notice that a chain finished, sent to its submission node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationRecord {
    pub submission_node: PartitionId,
    pub submission: SubmissionId,
    pub chain: ChainId,
    pub parent: Option<ChainId>,
    pub children: u32,
    pub replication_factor: u32,
}

impl From<&Chain> for TerminationRecord {
    fn from(chain: &Chain) -> Self {
        Self {
            submission_node: chain.submission_node,
            submission: chain.submission,
            chain: chain.id,
            parent: chain.parent,
            children: chain.children,
            replication_factor: chain.replication_factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Chain {
        Chain::new(ChainId::new(1), SubmissionId::new(9), PartitionId::new(2))
    }

    #[test]
    fn pipeline_is_bounded() {
        let mut chain = root();
        for i in 0..MAX_STAGES {
            chain.push_stage(format!("s{i}"), vec![]).unwrap();
        }
        let err = chain.push_stage("overflow", vec![]).unwrap_err();
        assert!(matches!(err, ChainError::PipelineFull { max: MAX_STAGES }));
        assert_eq!(chain.stages().len(), MAX_STAGES);
    }

    #[test]
    fn raw_size_matches_serialized_params() {
        let chain = root()
            .with_stage("filter", vec![Value::Int(5), Value::from("x")])
            .unwrap();
        let spec = &chain.stages()[0];
        let expected = postcard::to_allocvec(spec.params()).unwrap().len() as u32;
        assert_eq!(spec.raw_size(), expected);
        assert!(spec.raw_size() > 0);
    }

    #[test]
    fn child_inherits_submission_and_counts() {
        let mut parent = root();
        let child = parent.spawn_child(ChainId::new(2));
        assert_eq!(parent.children(), 1);
        assert_eq!(child.parent(), Some(ChainId::new(1)));
        assert_eq!(child.submission(), SubmissionId::new(9));
        assert_eq!(child.submission_node(), PartitionId::new(2));
        assert!(child.stages().is_empty());
        assert_eq!(child.destination(), None);
    }

    #[test]
    fn termination_record_from_chain() {
        let mut chain = root();
        chain.set_replication_factor(3);
        let _ = chain.spawn_child(ChainId::new(5));
        let record = TerminationRecord::from(&chain);
        assert_eq!(record.chain, ChainId::new(1));
        assert_eq!(record.parent, None);
        assert_eq!(record.children, 1);
        assert_eq!(record.replication_factor, 3);
        assert_eq!(record.submission_node, PartitionId::new(2));
    }

    #[test]
    fn chain_survives_the_wire() {
        let mut chain = root().with_stage("scan", vec![Value::Int(1)]).unwrap();
        chain.set_destination(PartitionId::new(1));
        let bytes = postcard::to_allocvec(&chain).unwrap();
        let back: Chain = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, chain);
    }
}
