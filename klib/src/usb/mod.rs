pub mod array_map;
pub mod classdriver;
pub mod descriptor;
pub mod endpoint;
pub mod memory;
pub mod setupdata;
pub mod xhci;
