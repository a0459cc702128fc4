pub mod annotator;
pub mod class_table;
pub mod frame;
pub mod nms;
