mod state_machine;
mod support;
