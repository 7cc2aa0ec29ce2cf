mod arithmetic;
mod control_flow;
mod data_transfer;
