//! Block yield protocol.
//!
//! Native iteration helpers drive the block attached to their call
//! site: an anchor (the nested interpreter pass) runs the block, and
//! the three block exits surface as structured outcomes instead of
//! propagating raw. `break` terminates the iteration, `continue`
//! carries the iteration's value, `return` belongs to the method that
//! owns the block and keeps propagating.

use crate::error::{Unwind, VmResult};
use crate::object::{InternalData, ObjKind, ObjRef};
use crate::value::Value;
use crate::vm::Vm;

/// How one yield into a block ended.
#[derive(Debug)]
pub enum YieldOutcome {
    /// The iteration's value (from `continue` or the block's tail).
    Value(Value),
    /// `break`: terminate the enclosing iteration.
    Break,
    /// `return`: unwinds the method that contains the block.
    Return(Value),
}

/// Resolves a block value (a Block instance or a bare closure) to its
/// callable.
pub fn block_callable(vm: &Vm, block: Value) -> Option<ObjRef> {
    let r = block.as_obj()?;
    match vm.heap.kind(r) {
        ObjKind::Closure | ObjKind::Native => Some(r),
        ObjKind::Instance => {
            let internal = vm.heap.instance(r).internal?;
            match &vm.heap.internal(internal).data {
                InternalData::Block { callable } => Some(*callable),
                _ => None,
            }
        }
        _ => None,
    }
}

/// The block attached to the currently running native call, if the
/// caller supplied one.
pub fn current_block(vm: &Vm) -> Option<Value> {
    vm.frame().block.or_else(|| vm.nearest_block())
}

/// Runs one iteration of `block` with `args`. User exceptions and
/// block `return` propagate; `break` and `continue` are folded into
/// the outcome.
pub fn yield_to_block(vm: &mut Vm, block: Value, args: &[Value]) -> VmResult<YieldOutcome> {
    let Some(callable) = block_callable(vm, block) else {
        let klass = vm.core.error;
        return Err(vm.throw_error(klass, "no block given"));
    };
    // Blocks run with the receiver of the frame they were written in.
    let this = vm
        .ec()
        .frames
        .iter()
        .rev()
        .find(|f| !f.is_native)
        .and_then(|f| f.this);

    match vm.call_callable_sync(callable, Value::Obj(callable), this, args) {
        Ok(v) => Ok(YieldOutcome::Value(v)),
        Err(Unwind::ContinueBlock(v)) => Ok(YieldOutcome::Value(v)),
        Err(Unwind::BreakBlock) => Ok(YieldOutcome::Break),
        Err(Unwind::ReturnBlock(v)) => Ok(YieldOutcome::Return(v)),
        Err(other) => Err(other),
    }
}

/// Shared driver for the iteration helpers: yields every element of
/// `items` into the current block, applying `each_result` to each
/// iteration value. Returns Some(value) when the block forced an early
/// exit (`break` yields nil, `return` propagates).
pub fn drive_block_iteration(
    vm: &mut Vm,
    block: Value,
    items: &[Value],
    mut each_result: impl FnMut(&mut Vm, Value, Value) -> bool,
) -> VmResult<Option<Value>> {
    for &item in items {
        match yield_to_block(vm, block, &[item])? {
            YieldOutcome::Value(v) => {
                let stop = each_result(vm, item, v);
                if stop {
                    return Ok(None);
                }
            }
            YieldOutcome::Break => return Ok(Some(Value::Nil)),
            YieldOutcome::Return(v) => return Err(Unwind::ReturnBlock(v)),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_callable_unwraps_block_instances() {
        let mut vm = Vm::new();
        let f = crate::object::FunctionObj::new(
            crate::chunk::Chunk::new(),
            crate::object::FunctionKind::Block,
        );
        let f = vm.alloc_function(f);
        let closure = vm.new_closure(f, Vec::new());

        assert_eq!(block_callable(&vm, Value::Obj(closure)), Some(closure));
        assert_eq!(block_callable(&vm, Value::Nil), None);

        let block_class = vm.core.block.unwrap();
        let inst = vm.new_instance(block_class);
        let internal = vm.new_internal(InternalData::Block { callable: closure });
        vm.heap.instance_mut(inst).internal = Some(internal);
        assert_eq!(block_callable(&vm, Value::Obj(inst)), Some(closure));
    }
}
