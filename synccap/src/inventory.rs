use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use synccap_core::traits::{Camera, DeviceInfo, DeviceSystem};

use crate::error::ContextError;

/// 设备连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Discovered,
    Initialized,
    Streaming,
    Deinitialized,
    Faulted,
}

/// 枚举得到的设备
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    info: DeviceInfo,
    state: ConnectionState,
}

impl Device {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn serial_number(&self) -> &str {
        &self.info.serial_number
    }

    pub fn index(&self) -> usize {
        self.info.index
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }
}

#[derive(Debug, Default)]
struct InventoryState {
    open: bool,
    active_sessions: usize,
    devices: Vec<Device>,
}

type Shared = Arc<(Mutex<InventoryState>, Condvar)>;

fn lock(shared: &Shared) -> MutexGuard<'_, InventoryState> {
    shared.0.lock().unwrap_or_else(|e| e.into_inner())
}

// 进程内已打开上下文的设备系统，按 Arc 数据指针区分
static OPEN_SYSTEMS: Lazy<Mutex<HashSet<usize>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn open_systems() -> MutexGuard<'static, HashSet<usize>> {
    OPEN_SYSTEMS.lock().unwrap_or_else(|e| e.into_inner())
}

/// 设备清单与进程级设备系统上下文
///
/// 同一时刻最多一个打开的上下文；关闭时等待所有会话结束；关闭后可以再次打开。
pub struct DeviceInventory {
    system: Arc<dyn DeviceSystem>,
    shared: Shared,
}

impl fmt::Debug for DeviceInventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared);
        f.debug_struct("DeviceInventory")
            .field("open", &state.open)
            .field("devices", &state.devices.len())
            .field("sessions", &state.active_sessions)
            .finish()
    }
}

impl DeviceInventory {
    pub fn new(system: Arc<dyn DeviceSystem>) -> Self {
        Self {
            system,
            shared: Arc::new((Mutex::new(InventoryState::default()), Condvar::new())),
        }
    }

    pub fn is_open(&self) -> bool {
        lock(&self.shared).open
    }

    pub fn active_sessions(&self) -> usize {
        lock(&self.shared).active_sessions
    }

    fn system_key(&self) -> usize {
        Arc::as_ptr(&self.system) as *const () as usize
    }

    /// 建立进程级上下文
    pub fn open_context(&self) -> Result<(), ContextError> {
        let mut state = lock(&self.shared);
        if state.open {
            return Err(ContextError::AlreadyOpen);
        }
        // 同一设备系统在进程内只允许一个打开的上下文，不论来自哪个清单
        let key = self.system_key();
        if !open_systems().insert(key) {
            return Err(ContextError::AlreadyOpen);
        }
        if let Err(e) = self.system.initialize() {
            open_systems().remove(&key);
            return Err(ContextError::System(e));
        }
        state.open = true;
        tracing::info!(
            "Device system context opened ({})",
            self.system.library_version()
        );
        Ok(())
    }

    /// 扫描设备；已知设备保留其连接状态
    pub fn enumerate(&self) -> Result<Vec<Device>, ContextError> {
        if !self.is_open() {
            return Err(ContextError::NotOpen);
        }
        let infos = self.system.list_devices().map_err(ContextError::System)?;

        let mut state = lock(&self.shared);
        let devices: Vec<Device> = infos
            .into_iter()
            .map(|info| {
                let known = state
                    .devices
                    .iter()
                    .find(|d| d.info.id == info.id)
                    .map(|d| d.state);
                for (name, value) in &info.information {
                    tracing::debug!("[{}] {}: {}", info.serial_number, name, value);
                }
                Device {
                    info,
                    state: known.unwrap_or(ConnectionState::Discovered),
                }
            })
            .collect();
        tracing::info!("Enumerated {} devices", devices.len());
        state.devices = devices.clone();
        Ok(devices)
    }

    /// 当前已知设备的快照
    pub fn devices(&self) -> Vec<Device> {
        lock(&self.shared).devices.clone()
    }

    /// 打开设备并登记一个会话租约；租约 Drop 时会话结束
    pub fn open_device(&self, device: &Device) -> Result<(Box<dyn Camera>, SessionLease), ContextError> {
        let mut state = lock(&self.shared);
        if !state.open {
            return Err(ContextError::NotOpen);
        }
        let camera = self.system.open(device.id()).map_err(ContextError::System)?;
        state.active_sessions += 1;
        drop(state);

        Ok((
            camera,
            SessionLease {
                shared: self.shared.clone(),
                device_id: device.id().to_string(),
            },
        ))
    }

    /// 关闭上下文，最多等待 `wait` 让所有会话结束
    pub fn close_context(&self, wait: Duration) -> Result<(), ContextError> {
        let (mutex, cvar) = &*self.shared;
        // 超出 Instant 表示范围时一直等
        let deadline = Instant::now().checked_add(wait);
        let mut state = mutex.lock().unwrap_or_else(|e| e.into_inner());
        if !state.open {
            return Err(ContextError::NotOpen);
        }

        while state.active_sessions > 0 {
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ContextError::SessionsOutstanding(state.active_sessions));
                    }
                    cvar.wait_timeout(state, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0)
                }
                None => cvar.wait(state).unwrap_or_else(|e| e.into_inner()),
            };
        }

        self.system.shutdown().map_err(ContextError::System)?;
        state.open = false;
        open_systems().remove(&self.system_key());
        for d in state.devices.iter_mut() {
            d.state = ConnectionState::Deinitialized;
        }
        tracing::info!("Device system context closed");
        Ok(())
    }
}

impl Drop for DeviceInventory {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close_context(Duration::ZERO) {
                tracing::warn!("Device system context left open on drop: {}", e);
                open_systems().remove(&self.system_key());
            }
        }
    }
}

/// 会话租约：存在期间上下文不能关闭
pub struct SessionLease {
    shared: Shared,
    device_id: String,
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl SessionLease {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// 更新清单中该设备的连接状态
    pub fn mark(&self, state: ConnectionState) {
        let mut inner = lock(&self.shared);
        if let Some(d) = inner.devices.iter_mut().find(|d| d.info.id == self.device_id) {
            d.state = state;
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let (mutex, cvar) = &*self.shared;
        let mut state = mutex.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(d) = state.devices.iter_mut().find(|d| d.info.id == self.device_id) {
            if d.state != ConnectionState::Faulted {
                d.state = ConnectionState::Deinitialized;
            }
        }
        state.active_sessions = state.active_sessions.saturating_sub(1);
        cvar.notify_all();
    }
}
