use std::fmt;

/// One entry of a traceback: the line being executed in a frame, and
/// the name of its function (`None` for the top-level script).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub line: u32,
    pub name: Option<String>,
}

/// Represents a runtime error, i.e. a traceback.
/// Frames are recorded innermost call first, the order they unwound.
#[derive(Debug, PartialEq, Eq)]
pub struct Trace {
    pub message: String,
    pub frames: Vec<TraceFrame>,
}

impl Trace {
    /// Creates a new traceback with no context yet.
    pub fn error(message: impl Into<String>) -> Trace {
        Trace {
            message: message.into(),
            frames: vec![],
        }
    }

    /// Used to add call context while unwinding the stack.
    pub fn add_context(&mut self, line: u32, name: Option<String>) {
        self.frames.push(TraceFrame { line, name });
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;

        for frame in self.frames.iter() {
            match &frame.name {
                Some(name) => write!(f, "\n[line {}] in {}()", frame.line, name)?,
                None => write!(f, "\n[line {}] in script", frame.line)?,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn traceback() {
        let mut trace = Trace::error("Operands must be two numbers or two strings.");
        trace.add_context(1, Some("f".to_string()));
        trace.add_context(1, None);

        let target = "Operands must be two numbers or two strings.\n\
                      [line 1] in f()\n\
                      [line 1] in script";

        assert_eq!(format!("{}", trace), target);
    }
}
