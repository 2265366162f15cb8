//! 内存事件回调与分配校验回调
//!
//! 两类条目都按注册顺序保存：
//!
//! - 事件回调以 (名字, 参数) 唯一，每次段提交后收到 `Alloc`、归还前收到
//!   `Free`，调用时 hotplug 写锁已被持有；回调里只能使用 `*_thread_unsafe`
//!   系列遍历，调用加锁版本会死锁；
//! - 校验回调以 (名字, 节点) 唯一，增长会使该节点用量超过上限时被调用，
//!   返回非零即否决这次增长。
//!
//! 旧式内存模型下段集合固定，注册返回 `NotSupported`。

use std::sync::Arc;

use crate::error::{AllocFailure, MemError, MemResult};
use crate::sync::{LockRank, RankedRwLock};
use crate::CALLBACK_NAME_MAX_LEN;

/// 内存事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemEvent {
    Alloc,
    Free,
}

/// 事件回调：(事件, 地址, 长度, 注册时的参数)
pub type EventCallback = Arc<dyn Fn(MemEvent, usize, usize, usize) + Send + Sync>;

/// 校验回调：(节点, 当前用量, 增长后用量) -> 否决码，0 放行
pub type ValidatorCallback = Arc<dyn Fn(i32, usize, usize) -> i32 + Send + Sync>;

struct EventEntry {
    name: String,
    arg: usize,
    cb: EventCallback,
}

struct ValidatorEntry {
    name: String,
    socket_id: i32,
    limit: usize,
    cb: ValidatorCallback,
}

fn check_name(name: &str) -> MemResult<()> {
    if name.is_empty() || name.len() >= CALLBACK_NAME_MAX_LEN {
        return Err(MemError::invalid(format!(
            "callback name must be 1..{} bytes",
            CALLBACK_NAME_MAX_LEN - 1
        )));
    }
    Ok(())
}

pub struct CallbackRegistry {
    supported: bool,
    events: RankedRwLock<Vec<EventEntry>>,
    validators: RankedRwLock<Vec<ValidatorEntry>>,
}

impl CallbackRegistry {
    pub(crate) fn new(supported: bool) -> Self {
        Self {
            supported,
            events: RankedRwLock::new(LockRank::Callbacks, Vec::new()),
            validators: RankedRwLock::new(LockRank::Callbacks, Vec::new()),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.supported
    }

    fn ensure_supported(&self) -> MemResult<()> {
        if self.supported {
            Ok(())
        } else {
            Err(MemError::NotSupported(
                "memory callbacks in legacy memory mode",
            ))
        }
    }

    // ------------------------------------------------------------------------
    // 事件回调
    // ------------------------------------------------------------------------

    pub fn register_event(&self, name: &str, cb: EventCallback, arg: usize) -> MemResult<()> {
        self.ensure_supported()?;
        check_name(name)?;
        let mut events = self.events.write();
        if events.iter().any(|e| e.name == name && e.arg == arg) {
            return Err(MemError::AlreadyExists(format!(
                "event callback '{name}' with arg {arg:#x}"
            )));
        }
        events.push(EventEntry {
            name: name.to_string(),
            arg,
            cb,
        });
        log::info!("registered memory event callback '{name}'");
        Ok(())
    }

    pub fn unregister_event(&self, name: &str, arg: usize) -> MemResult<()> {
        self.ensure_supported()?;
        let mut events = self.events.write();
        let pos = events
            .iter()
            .position(|e| e.name == name && e.arg == arg)
            .ok_or_else(|| MemError::NotFound(format!("event callback '{name}'")))?;
        events.remove(pos);
        log::info!("unregistered memory event callback '{name}'");
        Ok(())
    }

    /// 按注册顺序同步通知
    ///
    /// 先在锁内拷贝回调列表再逐个调用，回调期间不持有回调表锁。
    pub(crate) fn notify(&self, event: MemEvent, addr: usize, len: usize) {
        let snapshot: Vec<(EventCallback, usize)> = self
            .events
            .read()
            .iter()
            .map(|e| (e.cb.clone(), e.arg))
            .collect();
        for (cb, arg) in snapshot {
            cb(event, addr, len, arg);
        }
    }

    // ------------------------------------------------------------------------
    // 校验回调
    // ------------------------------------------------------------------------

    pub fn register_validator(
        &self,
        name: &str,
        cb: ValidatorCallback,
        socket_id: i32,
        limit: usize,
    ) -> MemResult<()> {
        self.ensure_supported()?;
        check_name(name)?;
        if socket_id < 0 {
            return Err(MemError::invalid("validator needs a concrete socket"));
        }
        let mut validators = self.validators.write();
        if validators
            .iter()
            .any(|v| v.name == name && v.socket_id == socket_id)
        {
            return Err(MemError::AlreadyExists(format!(
                "validator '{name}' on socket {socket_id}"
            )));
        }
        validators.push(ValidatorEntry {
            name: name.to_string(),
            socket_id,
            limit,
            cb,
        });
        log::info!("registered allocation validator '{name}' for socket {socket_id}, limit {limit}");
        Ok(())
    }

    pub fn unregister_validator(&self, name: &str, socket_id: i32) -> MemResult<()> {
        self.ensure_supported()?;
        let mut validators = self.validators.write();
        let pos = validators
            .iter()
            .position(|v| v.name == name && v.socket_id == socket_id)
            .ok_or_else(|| MemError::NotFound(format!("validator '{name}' on socket {socket_id}")))?;
        validators.remove(pos);
        Ok(())
    }

    /// 增长前校验：用量将超过上限的条目依次被询问，任一否决即失败
    pub(crate) fn validate(&self, socket_id: i32, current: usize, proposed: usize) -> MemResult<()> {
        let snapshot: Vec<(String, ValidatorCallback)> = self
            .validators
            .read()
            .iter()
            .filter(|v| v.socket_id == socket_id && proposed > v.limit)
            .map(|v| (v.name.clone(), v.cb.clone()))
            .collect();
        for (name, cb) in snapshot {
            let code = cb(socket_id, current, proposed);
            if code != 0 {
                log::warn!(
                    "validator '{name}' vetoed growth on socket {socket_id}: {current} -> {proposed} (code {code})"
                );
                return Err(MemError::oom(
                    proposed - current,
                    socket_id,
                    AllocFailure::Vetoed,
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_duplicate_event_registration() {
        let reg = CallbackRegistry::new(true);
        let cb: EventCallback = Arc::new(|_, _, _, _| {});
        reg.register_event("dup", cb.clone(), 1).unwrap();
        assert!(matches!(
            reg.register_event("dup", cb.clone(), 1),
            Err(MemError::AlreadyExists(_))
        ));
        // 不同参数是另一个条目
        reg.register_event("dup", cb.clone(), 2).unwrap();
        reg.unregister_event("dup", 1).unwrap();
        reg.register_event("dup", cb, 1).unwrap();
        assert!(matches!(
            reg.unregister_event("missing", 0),
            Err(MemError::NotFound(_))
        ));
    }

    #[test]
    fn test_events_fire_in_registration_order() {
        let reg = CallbackRegistry::new(true);
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let log = log.clone();
            reg.register_event(
                name,
                Arc::new(move |ev, addr, len, arg| log.lock().push((name, ev, addr, len, arg))),
                7,
            )
            .unwrap();
        }
        reg.notify(MemEvent::Alloc, 0x1000, 0x2000);
        let log = log.lock();
        let names: Vec<_> = log.iter().map(|e| e.0).collect();
        assert_eq!(names, ["first", "second", "third"]);
        assert!(log.iter().all(|e| e.1 == MemEvent::Alloc && e.2 == 0x1000 && e.3 == 0x2000 && e.4 == 7));
    }

    #[test]
    fn test_validator_only_fires_past_limit() {
        let reg = CallbackRegistry::new(true);
        let calls = Arc::new(Mutex::new(0));
        let c = calls.clone();
        reg.register_validator(
            "cap",
            Arc::new(move |_, _, _| {
                *c.lock() += 1;
                -1
            }),
            0,
            8 << 20,
        )
        .unwrap();
        assert!(reg.validate(0, 0, 8 << 20).is_ok());
        assert!(reg.validate(1, 0, 64 << 20).is_ok());
        let err = reg.validate(0, 8 << 20, 9 << 20).unwrap_err();
        assert_eq!(err.alloc_failure(), Some(AllocFailure::Vetoed));
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn test_not_supported_is_distinct() {
        let reg = CallbackRegistry::new(false);
        let r = reg.register_event("x", Arc::new(|_, _, _, _| {}), 0);
        assert!(matches!(r, Err(MemError::NotSupported(_))));
        let r = reg.register_validator("x", Arc::new(|_, _, _| 0), 0, 0);
        assert!(matches!(r, Err(MemError::NotSupported(_))));
    }

    #[test]
    fn test_bad_names_rejected() {
        let reg = CallbackRegistry::new(true);
        let cb: EventCallback = Arc::new(|_, _, _, _| {});
        assert!(reg.register_event("", cb.clone(), 0).is_err());
        let long = "x".repeat(CALLBACK_NAME_MAX_LEN);
        assert!(reg.register_event(&long, cb, 0).is_err());
    }
}
