pub mod memory;

pub use memory::{Failure, MemoryAuthProvider, MemoryContextProcedures, MemoryMembershipSource};
