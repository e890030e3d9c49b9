pub mod proc_tree;
pub mod script;
pub mod supervisor;

pub use script::{CommandScript, script_name_fragment};
pub use supervisor::{LogLine, ProcessSupervisor, SupervisedProcess};
