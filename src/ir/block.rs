//! Basic blocks.

use crate::ir::function::FunctionId;
use crate::ir::statement::Statement;
use crate::regalloc::register_file::RegisterFile;

/// Index of a block within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub usize);

impl BlockId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Where control goes after a block's statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Jump(BlockId),
    FunctionExit,
}

/// An ordered list of statements with exactly one exit.
#[derive(Debug, Clone)]
pub struct Block {
    id: BlockId,
    function: FunctionId,
    pub(crate) statements: Vec<Statement>,
    pub(crate) exit: Exit,
    /// Top-of-block register occupancy, filled in by the allocator and used
    /// to coordinate allocation across the dominator tree.
    pub(crate) register_file: RegisterFile,
}

impl Block {
    pub(crate) fn new(id: BlockId, function: FunctionId) -> Self {
        Block {
            id,
            function,
            statements: Vec::new(),
            exit: Exit::FunctionExit,
            register_file: RegisterFile::new(),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn exit(&self) -> Exit {
        self.exit
    }

    pub fn register_file(&self) -> &RegisterFile {
        &self.register_file
    }

    /// Append a statement, returning its index within the block.
    pub(crate) fn push(&mut self, statement: Statement) -> usize {
        self.statements.push(statement);
        self.statements.len() - 1
    }
}
