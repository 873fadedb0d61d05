//! The pipeline graph.
//!
//! A pipeline owns four function symbols derived from its id: `init_N`,
//! `body_N`, `reset_N` and, when other pipelines consume its output,
//! `size_N`. Predecessor/successor links form a DAG the driver schedules
//! topologically; the optional driver predecessor paces morsel dispatch
//! for split pipelines.

/// Index of a pipeline within its [`PipelineBuilder`].
pub type PipelineId = usize;

#[derive(Debug)]
pub struct Pipeline {
    id: PipelineId,
    driver: Option<PipelineId>,
    predecessors: Vec<PipelineId>,
    successors: Vec<PipelineId>,
    split: bool,
}

impl Pipeline {
    fn new(id: PipelineId) -> Self {
        Self {
            id,
            driver: None,
            predecessors: Vec::new(),
            successors: Vec::new(),
            split: false,
        }
    }

    pub fn init_name(&self) -> String {
        format!("init_{}", self.id)
    }

    pub fn body_name(&self) -> String {
        format!("body_{}", self.id)
    }

    pub fn reset_name(&self) -> String {
        format!("reset_{}", self.id)
    }

    pub fn size_name(&self) -> String {
        format!("size_{}", self.id)
    }

    /// The predecessor whose output size paces morsel dispatch.
    pub fn driver(&self) -> Option<PipelineId> {
        self.driver
    }

    pub fn predecessors(&self) -> &[PipelineId] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[PipelineId] {
        &self.successors
    }

    /// Whether `body` takes a `(start, end)` morsel range.
    pub fn split(&self) -> bool {
        self.split
    }
}

/// Builds the pipeline DAG while the planner translates operators.
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    pipelines: Vec<Pipeline>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_pipeline(&mut self) -> PipelineId {
        let id = self.pipelines.len();
        self.pipelines.push(Pipeline::new(id));
        id
    }

    /// Links `pred` as an input of `pipeline`.
    pub fn add_predecessor(&mut self, pipeline: PipelineId, pred: PipelineId) {
        self.pipelines[pipeline].predecessors.push(pred);
        self.pipelines[pred].successors.push(pipeline);
    }

    /// Marks `pred` as the pacing input of `pipeline`.
    pub fn set_driver(&mut self, pipeline: PipelineId, pred: PipelineId) {
        self.pipelines[pipeline].driver = Some(pred);
        self.add_predecessor(pipeline, pred);
    }

    pub fn set_split(&mut self, pipeline: PipelineId, split: bool) {
        self.pipelines[pipeline].split = split;
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    pub fn finish(self) -> Vec<Pipeline> {
        self.pipelines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_bidirectional() {
        let mut b = PipelineBuilder::new();
        let scan = b.create_pipeline();
        let join = b.create_pipeline();
        let sink = b.create_pipeline();
        b.set_driver(join, scan);
        b.add_predecessor(sink, join);
        b.set_split(join, true);

        let pipelines = b.finish();
        assert_eq!(pipelines[join].driver(), Some(scan));
        assert_eq!(pipelines[scan].successors(), &[join]);
        assert_eq!(pipelines[sink].predecessors(), &[join]);
        assert!(pipelines[join].split());
        assert_eq!(pipelines[join].body_name(), "body_1");
        assert_eq!(pipelines[scan].size_name(), "size_0");
    }
}
