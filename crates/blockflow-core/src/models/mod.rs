pub mod block;
pub mod graph;
pub mod value;

pub use block::{
    BashConfig, Block, BlockKind, BlockType, BranchConfig, CastConfig, CommandConfig, Edge,
    EdgeTag, PromptConfig, VariableConfig,
};
pub use graph::{is_valid_variable_name, BlockGraph, CommandArgument};
pub use value::{Value, ValueType};
