pub mod node;
pub mod stack;
pub mod tree;

pub use node::{
    Attachment, Capabilities, ChildList, PropertyKey, PropertyValue, StageKind, StageNode,
    StageStatus,
};
pub use stack::ActiveStageStack;
pub use tree::{StageId, StageTree};
