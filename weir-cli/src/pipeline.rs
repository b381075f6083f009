//! Parses a YAML pipeline file into a runnable [`weir::Engine`] over the
//! line-delimited-JSON file reference `Source`/`Sink`.
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use weir::config::EngineConfig;
use weir::refs::file::{FileSink, FileSource};
use weir::refs::processors::{Filter, JsonDecode, RegexMask, RenameField};
use weir::{Engine, Error, Processor};

/// One entry in a pipeline file's `processors` list.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ProcessorSpec {
    JsonDecode,
    RenameField { mapping: BTreeMap<String, String> },
    RegexMask {
        field: String,
        pattern: String,
        replacement: String,
    },
    FilterEquals { field: String, value: String },
    FilterGreaterThan { field: String, value: f64 },
}

impl ProcessorSpec {
    fn build(self) -> Result<Arc<dyn Processor>, Error> {
        Ok(match self {
            ProcessorSpec::JsonDecode => Arc::new(JsonDecode),
            ProcessorSpec::RenameField { mapping } => Arc::new(RenameField::new(mapping)),
            ProcessorSpec::RegexMask {
                field,
                pattern,
                replacement,
            } => Arc::new(RegexMask::new(field, &pattern, replacement)?),
            ProcessorSpec::FilterEquals { field, value } => Arc::new(Filter::equals(field, value)),
            ProcessorSpec::FilterGreaterThan { field, value } => {
                Arc::new(Filter::greater_than(field, value))
            }
        })
    }
}

/// The on-disk shape of a `weir run` pipeline file: engine knobs plus the
/// file source/sink paths and a named processor chain.
#[derive(Debug, Deserialize)]
pub struct PipelineFile {
    #[serde(flatten)]
    pub engine: EngineConfig,
    /// Path to a line-delimited-JSON file read by [`weir::refs::file::FileSource`].
    pub input: String,
    /// Path to a line-delimited-JSON file written by [`weir::refs::file::FileSink`].
    pub output: String,
    /// Processor chain, applied in order.
    #[serde(default)]
    processors: Vec<ProcessorSpec>,
}

impl PipelineFile {
    /// Parses and validates a pipeline file from its YAML text.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let file: PipelineFile = serde_yaml::from_str(raw)?;
        file.engine.validate()?;
        Ok(file)
    }

    /// Builds the processor chain named by this file. Consumes `self`
    /// because compiling a `RegexMask` pattern can fail.
    pub fn build_processors(self) -> Result<Vec<Arc<dyn Processor>>, Error> {
        self.processors.into_iter().map(ProcessorSpec::build).collect()
    }

    /// Opens the configured input/output files and returns a ready-to-run
    /// engine plus the processor chain already consumed from `self`.
    pub async fn into_engine(self) -> Result<Engine<FileSource, FileSink>, Error> {
        let input = self.input.clone();
        let output = self.output.clone();
        let engine_config = self.engine.clone();
        let processors = self.build_processors()?;

        let source = FileSource::open(&input).await?;
        let sink = FileSink::create(&output).await?;
        Ok(Engine::new(source, sink, processors, engine_config))
    }
}
