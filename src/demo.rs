//! Built-in lattices for exercising a deployment.

use latticework_graph::{Electron, GraphError, Lattice, Scope, Traced};
use serde_json::json;

/// `square(x) = (x, x ** 2)`
fn square() -> Electron {
  Electron::new("square", |args, _ctx| {
    let x: i64 = args.param(0, "x")?;
    Ok(json!([x, x * x]))
  })
}

fn pair(scope: &mut Scope, value: &Traced) -> Result<(Traced, Traced), GraphError> {
  let mut items = scope.unpack(value, 2)?.into_iter();
  match (items.next(), items.next()) {
    (Some(first), Some(second)) => Ok((first, second)),
    _ => Err(GraphError::UnpackLength {
      expected: 2,
      found: 0,
    }),
  }
}

/// Calls `square` `rounds + 1` times, feeding each call the first element
/// of the previous result, and returns `(last square, last x)`.
pub fn chain(rounds: usize, executor: &str) -> Lattice {
  let square = square().with_executor(executor);
  Lattice::new("chain", move |scope, inputs| {
    let out = scope.call(&square, vec![], vec![("x", inputs.kwarg("x")?)])?;
    let (mut result, mut b) = pair(scope, &out)?;
    for _ in 0..rounds {
      let out = scope.call(&square, vec![], vec![("x", result)])?;
      (result, b) = pair(scope, &out)?;
    }
    Ok(Traced::tuple([b, result]))
  })
}
