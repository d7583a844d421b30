//! Task pipeline: event translation, response frames and consumer state

mod response;
mod state;
mod task_pipeline;

pub use response::{
    AgentLogStreamResponse, BlockingResponse, ErrorStreamResponse, MessageAudioStreamResponse,
    MessageBlockingResponse, MessageEndStreamResponse, MessageMetadata, PingStreamResponse,
    StoppedBlockingResponse, StreamResponse, TextChunkData, TextChunkStreamResponse,
    WorkflowBlockingResponse, WorkflowFinishData, WorkflowFinishStreamResponse, WorkflowStartData,
    WorkflowStartStreamResponse,
};
pub use state::{PipelineState, TaskState};
pub use task_pipeline::{ProcessOutput, ResponseStream, TaskPipeline};
