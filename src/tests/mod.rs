mod session_flow;
mod support;
