/// Outcome of evaluating a node. Anything but `Normal` unwinds until a loop,
/// function call or the top level absorbs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Normal(i32),
    Return(i32),
    Break(usize),
    Continue(usize),
    Exit(i32),
}

impl Flow {
    pub fn status(self) -> i32 {
        match self {
            Flow::Normal(status) | Flow::Return(status) | Flow::Exit(status) => status,
            Flow::Break(_) | Flow::Continue(_) => 0,
        }
    }

    pub fn from_bool(ok: bool) -> Self {
        Flow::Normal(if ok { 0 } else { 1 })
    }
}
