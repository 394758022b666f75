pub mod lines;
pub mod send_recv;
pub mod weight_channel;
