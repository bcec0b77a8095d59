mod any;
mod array;
mod context;
mod dictionary;
mod engine;
mod error;
mod gc;
mod handle;
mod init_list;
mod interning;
mod object;
mod promise;
mod scheduler;
mod threads;
mod types;
mod value;

pub use any::*;
pub use array::ScriptArray;
pub use context::{Context, ContextState, FunctionBody, ScriptFunction, UserData};
pub use dictionary::*;
pub use engine::*;
pub use error::*;
pub use gc::*;
pub use handle::*;
pub use init_list::*;
pub use interning::*;
pub use object::*;
pub use promise::*;
pub use scheduler::*;
pub use threads::*;
pub use types::*;
pub use value::{Payload, Primitive, Storable, copy_object};
