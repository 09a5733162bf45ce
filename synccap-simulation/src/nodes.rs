use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use synccap_core::error::{CameraError, Result};
use synccap_core::traits::{NodeAccess, NodeKind, NodeMap};

/// 模拟节点的值
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Integer { value: i64, min: i64, max: i64 },
    Float { value: f64, min: f64, max: f64 },
    Boolean(bool),
    Enumeration { current: String, entries: Vec<String> },
    Text(String),
    Command,
    Category(Vec<String>),
}

impl NodeValue {
    fn kind(&self) -> NodeKind {
        match self {
            Self::Integer { .. } => NodeKind::Integer,
            Self::Float { .. } => NodeKind::Float,
            Self::Boolean(_) => NodeKind::Boolean,
            Self::Enumeration { .. } => NodeKind::Enumeration,
            Self::Text(_) => NodeKind::String,
            Self::Command => NodeKind::Command,
            Self::Category(_) => NodeKind::Category,
        }
    }
}

impl fmt::Display for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer { value, .. } => write!(f, "{}", value),
            Self::Float { value, .. } => write!(f, "{}", value),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Enumeration { current, .. } => f.write_str(current),
            Self::Text(s) => f.write_str(s),
            Self::Command => f.write_str("<command>"),
            Self::Category(_) => f.write_str("<category>"),
        }
    }
}

#[derive(Debug, Clone)]
struct NodeEntry {
    value: NodeValue,
    access: NodeAccess,
    /// 仅当另一个节点等于某个条目时才可写 (e.g. LineSource 依赖 LineMode=Output)
    requires: Option<(String, String)>,
    /// 采集进行中不可写
    locked_while_streaming: bool,
}

#[derive(Debug, Default)]
struct Inner {
    /// key = 节点名，或 "节点名[选择器当前值]"
    nodes: HashMap<String, NodeEntry>,
    /// 节点 -> 控制它的选择器节点
    selected_by: HashMap<String, String>,
    /// 成功写入的记录，按时间顺序
    writes: Vec<String>,
}

impl Inner {
    fn key(&self, name: &str) -> String {
        match self.selected_by.get(name) {
            Some(selector) => {
                let current = match self.nodes.get(selector.as_str()).map(|e| &e.value) {
                    Some(NodeValue::Enumeration { current, .. }) => current.as_str(),
                    _ => "",
                };
                format!("{}[{}]", name, current)
            }
            None => name.to_string(),
        }
    }

    fn entry(&self, name: &str) -> Option<&NodeEntry> {
        self.nodes.get(&self.key(name))
    }

    fn access(&self, name: &str, streaming: bool) -> NodeAccess {
        let Some(entry) = self.entry(name) else {
            return NodeAccess::NONE;
        };
        let mut access = entry.access;
        if let Some((node, wanted)) = &entry.requires {
            let satisfied = matches!(
                self.entry(node).map(|e| &e.value),
                Some(NodeValue::Enumeration { current, .. }) if current == wanted
            );
            access.writable &= satisfied;
        }
        if entry.locked_while_streaming && streaming {
            access.writable = false;
        }
        access
    }
}

/// 模拟的 GenICam 风格节点表
///
/// 支持选择器 (LineSelector 切换后 LineMode/LineSource 指向不同的线) 和节点间的可写依赖。
pub struct SimNodeMap {
    inner: Mutex<Inner>,
    streaming: Arc<AtomicBool>,
}

impl fmt::Debug for SimNodeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("SimNodeMap")
            .field("nodes", &inner.nodes.len())
            .field("writes", &inner.writes.len())
            .finish()
    }
}

impl SimNodeMap {
    pub fn builder() -> SimNodeMapBuilder {
        SimNodeMapBuilder::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    fn check_readable(&self, inner: &Inner, name: &str) -> Result<()> {
        let a = inner.access(name, self.is_streaming());
        if !a.available {
            return Err(CameraError::NodeNotAvailable(name.to_string()));
        }
        if !a.readable {
            return Err(CameraError::NodeNotReadable(name.to_string()));
        }
        Ok(())
    }

    fn check_writable(&self, inner: &Inner, name: &str) -> Result<()> {
        let a = inner.access(name, self.is_streaming());
        if !a.available {
            return Err(CameraError::NodeNotAvailable(name.to_string()));
        }
        if !a.writable {
            return Err(CameraError::NodeNotWritable(name.to_string()));
        }
        Ok(())
    }

    fn read(&self, name: &str) -> Result<NodeValue> {
        let inner = self.lock();
        self.check_readable(&inner, name)?;
        inner
            .entry(name)
            .map(|e| e.value.clone())
            .ok_or_else(|| CameraError::NodeNotAvailable(name.to_string()))
    }

    /// 检查可写后用 `update` 修改节点值，成功时记入写入日志
    fn write<F>(&self, name: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut NodeValue) -> Result<()>,
    {
        let mut inner = self.lock();
        self.check_writable(&inner, name)?;
        let key = inner.key(name);
        let entry = inner
            .nodes
            .get_mut(&key)
            .ok_or_else(|| CameraError::NodeNotAvailable(name.to_string()))?;
        update(&mut entry.value)?;
        let record = format!("{}={}", key, entry.value);
        tracing::trace!("sim node write {}", record);
        inner.writes.push(record);
        Ok(())
    }

    /// 按时间顺序返回所有成功写入，格式为 "Key=Value"
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    /// 不经过访问检查直接读取 (key 可以带选择器后缀，如 "LineMode[Line2]")
    pub fn peek(&self, key: &str) -> Option<NodeValue> {
        self.lock().nodes.get(key).map(|e| e.value.clone())
    }

    /// 设备侧修改只读节点 (e.g. 采集开始后更新 StreamBufferCountResult)
    pub(crate) fn poke(&self, key: &str, value: NodeValue) {
        if let Some(entry) = self.lock().nodes.get_mut(key) {
            entry.value = value;
        }
    }

    /// 运行时修改节点访问权限，用于注入故障
    pub fn set_access(&self, key: &str, access: NodeAccess) {
        if let Some(entry) = self.lock().nodes.get_mut(key) {
            entry.access = access;
        }
    }

    pub fn export_state(&self) -> serde_json::Value {
        let inner = self.lock();
        let mut keys: Vec<&String> = inner.nodes.keys().collect();
        keys.sort();
        let map: serde_json::Map<String, serde_json::Value> = keys
            .into_iter()
            .filter_map(|k| {
                let entry = &inner.nodes[k.as_str()];
                match entry.value {
                    NodeValue::Command | NodeValue::Category(_) => None,
                    ref v => Some((k.clone(), serde_json::Value::String(v.to_string()))),
                }
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

fn type_mismatch(name: &str, expected: &'static str) -> CameraError {
    CameraError::TypeMismatch {
        node: name.to_string(),
        expected,
    }
}

impl NodeMap for SimNodeMap {
    fn access(&self, name: &str) -> NodeAccess {
        self.lock().access(name, self.is_streaming())
    }

    fn kind(&self, name: &str) -> Option<NodeKind> {
        self.lock().entry(name).map(|e| e.value.kind())
    }

    fn get_integer(&self, name: &str) -> Result<i64> {
        match self.read(name)? {
            NodeValue::Integer { value, .. } => Ok(value),
            _ => Err(type_mismatch(name, "Integer")),
        }
    }

    fn set_integer(&self, name: &str, v: i64) -> Result<()> {
        self.write(name, |node| match node {
            NodeValue::Integer { value, min, max } => {
                if v < *min || v > *max {
                    return Err(CameraError::OutOfRange {
                        node: name.to_string(),
                        value: v,
                    });
                }
                *value = v;
                Ok(())
            }
            _ => Err(type_mismatch(name, "Integer")),
        })
    }

    fn get_float(&self, name: &str) -> Result<f64> {
        match self.read(name)? {
            NodeValue::Float { value, .. } => Ok(value),
            _ => Err(type_mismatch(name, "Float")),
        }
    }

    fn set_float(&self, name: &str, v: f64) -> Result<()> {
        self.write(name, |node| match node {
            NodeValue::Float { value, min, max } => {
                if v < *min || v > *max {
                    return Err(CameraError::OutOfRange {
                        node: name.to_string(),
                        value: v as i64,
                    });
                }
                *value = v;
                Ok(())
            }
            _ => Err(type_mismatch(name, "Float")),
        })
    }

    fn get_boolean(&self, name: &str) -> Result<bool> {
        match self.read(name)? {
            NodeValue::Boolean(v) => Ok(v),
            _ => Err(type_mismatch(name, "Boolean")),
        }
    }

    fn set_boolean(&self, name: &str, v: bool) -> Result<()> {
        self.write(name, |node| match node {
            NodeValue::Boolean(value) => {
                *value = v;
                Ok(())
            }
            _ => Err(type_mismatch(name, "Boolean")),
        })
    }

    fn get_string(&self, name: &str) -> Result<String> {
        match self.read(name)? {
            NodeValue::Text(s) => Ok(s),
            _ => Err(type_mismatch(name, "String")),
        }
    }

    fn get_enum(&self, name: &str) -> Result<String> {
        match self.read(name)? {
            NodeValue::Enumeration { current, .. } => Ok(current),
            _ => Err(type_mismatch(name, "Enumeration")),
        }
    }

    fn set_enum(&self, name: &str, entry: &str) -> Result<()> {
        self.write(name, |node| match node {
            NodeValue::Enumeration { current, entries } => {
                if !entries.iter().any(|e| e == entry) {
                    return Err(CameraError::EntryNotAvailable {
                        node: name.to_string(),
                        entry: entry.to_string(),
                    });
                }
                *current = entry.to_string();
                Ok(())
            }
            _ => Err(type_mismatch(name, "Enumeration")),
        })
    }

    fn enum_entries(&self, name: &str) -> Result<Vec<String>> {
        match self.read(name)? {
            NodeValue::Enumeration { entries, .. } => Ok(entries),
            _ => Err(type_mismatch(name, "Enumeration")),
        }
    }

    fn execute(&self, name: &str) -> Result<()> {
        self.write(name, |node| match node {
            NodeValue::Command => Ok(()),
            _ => Err(type_mismatch(name, "Command")),
        })
    }

    fn category_features(&self, name: &str) -> Result<Vec<String>> {
        match self.read(name)? {
            NodeValue::Category(features) => Ok(features),
            _ => Err(type_mismatch(name, "Category")),
        }
    }
}

/// 节点表构造器
///
/// `scope` 设置后，定义的节点挂在当前选择器值下；`requires` / `locked_while_streaming`
/// 作用于最近定义的节点。
#[derive(Debug, Default)]
pub struct SimNodeMapBuilder {
    inner: Inner,
    scope: Option<String>,
    last_key: Option<String>,
}

impl SimNodeMapBuilder {
    fn define(mut self, name: &str, value: NodeValue, access: NodeAccess) -> Self {
        let key = match &self.scope {
            Some(scope) => format!("{}[{}]", name, scope),
            None => name.to_string(),
        };
        self.inner.nodes.insert(
            key.clone(),
            NodeEntry {
                value,
                access,
                requires: None,
                locked_while_streaming: false,
            },
        );
        self.last_key = Some(key);
        self
    }

    pub fn integer(self, name: &str, value: i64, min: i64, max: i64, access: NodeAccess) -> Self {
        self.define(name, NodeValue::Integer { value, min, max }, access)
    }

    pub fn float(self, name: &str, value: f64, min: f64, max: f64, access: NodeAccess) -> Self {
        self.define(name, NodeValue::Float { value, min, max }, access)
    }

    pub fn boolean(self, name: &str, value: bool, access: NodeAccess) -> Self {
        self.define(name, NodeValue::Boolean(value), access)
    }

    pub fn enumeration(
        self,
        name: &str,
        current: &str,
        entries: &[&str],
        access: NodeAccess,
    ) -> Self {
        let value = NodeValue::Enumeration {
            current: current.to_string(),
            entries: entries.iter().map(|e| e.to_string()).collect(),
        };
        self.define(name, value, access)
    }

    pub fn text(self, name: &str, value: &str) -> Self {
        self.define(name, NodeValue::Text(value.to_string()), NodeAccess::READ_ONLY)
    }

    pub fn command(self, name: &str) -> Self {
        self.define(name, NodeValue::Command, NodeAccess::READ_WRITE)
    }

    pub fn category(self, name: &str, features: &[&str]) -> Self {
        let features = features.iter().map(|f| f.to_string()).collect();
        self.define(name, NodeValue::Category(features), NodeAccess::READ_ONLY)
    }

    /// 声明 `node` 的取值由选择器 `selector` 决定
    pub fn selected_by(mut self, node: &str, selector: &str) -> Self {
        self.inner
            .selected_by
            .insert(node.to_string(), selector.to_string());
        self
    }

    /// 之后定义的节点挂在选择器值 `value` 下
    pub fn scope(mut self, value: &str) -> Self {
        self.scope = Some(value.to_string());
        self
    }

    pub fn global(mut self) -> Self {
        self.scope = None;
        self
    }

    pub fn requires(mut self, node: &str, entry: &str) -> Self {
        if let Some(e) = self.last_key.as_ref().and_then(|k| self.inner.nodes.get_mut(k)) {
            e.requires = Some((node.to_string(), entry.to_string()));
        }
        self
    }

    pub fn locked_while_streaming(mut self) -> Self {
        if let Some(e) = self.last_key.as_ref().and_then(|k| self.inner.nodes.get_mut(k)) {
            e.locked_while_streaming = true;
        }
        self
    }

    /// 覆盖某个 key 的访问权限 (已定义时生效)
    pub fn override_access(mut self, key: &str, access: NodeAccess) -> Self {
        if let Some(e) = self.inner.nodes.get_mut(key) {
            e.access = access;
        }
        self
    }

    /// 改写枚举节点的当前条目，条目不存在时忽略
    pub fn override_enum(mut self, key: &str, entry: &str) -> Self {
        if let Some(NodeValue::Enumeration { current, entries }) =
            self.inner.nodes.get_mut(key).map(|e| &mut e.value)
        {
            if entries.iter().any(|e| e == entry) {
                *current = entry.to_string();
            }
        }
        self
    }

    /// 删除某个 key，模拟缺失的特性
    pub fn remove(mut self, key: &str) -> Self {
        self.inner.nodes.remove(key);
        self
    }

    pub fn build(self, streaming: Arc<AtomicBool>) -> SimNodeMap {
        SimNodeMap {
            inner: Mutex::new(self.inner),
            streaming,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synccap_core::nodes::NodeMapExt;

    fn line_map() -> SimNodeMap {
        SimNodeMap::builder()
            .enumeration("LineSelector", "Line0", &["Line0", "Line1"], NodeAccess::READ_WRITE)
            .selected_by("LineMode", "LineSelector")
            .selected_by("LineSource", "LineSelector")
            .scope("Line0")
            .enumeration("LineMode", "Input", &["Input"], NodeAccess::READ_ONLY)
            .scope("Line1")
            .enumeration("LineMode", "Input", &["Input", "Output"], NodeAccess::READ_WRITE)
            .enumeration("LineSource", "Off", &["Off", "Counter0Active"], NodeAccess::READ_WRITE)
            .requires("LineMode", "Output")
            .global()
            .integer("Gain", 0, 0, 10, NodeAccess::READ_WRITE)
            .locked_while_streaming()
            .build(Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn selector_switches_node_instance() {
        let map = line_map();
        assert!(!map.is_available("LineSource"));
        map.set_enum("LineSelector", "Line1").unwrap();
        assert!(map.is_available("LineSource"));
        assert!(map.is_writable("LineMode"));
    }

    #[test]
    fn dependent_node_becomes_writable() {
        let map = line_map();
        map.set_enum("LineSelector", "Line1").unwrap();
        assert!(!map.is_writable("LineSource"));
        map.set_enum("LineMode", "Output").unwrap();
        assert!(map.is_writable("LineSource"));
        map.set_enum("LineSource", "Counter0Active").unwrap();
        assert_eq!(
            map.writes(),
            vec![
                "LineSelector=Line1",
                "LineMode[Line1]=Output",
                "LineSource[Line1]=Counter0Active"
            ]
        );
    }

    #[test]
    fn range_and_entry_checks() {
        let map = line_map();
        assert!(matches!(
            map.set_integer("Gain", 11),
            Err(CameraError::OutOfRange { value: 11, .. })
        ));
        assert!(matches!(
            map.set_enum("LineSelector", "Line9"),
            Err(CameraError::EntryNotAvailable { .. })
        ));
        assert!(matches!(
            map.get_float("Gain"),
            Err(CameraError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn streaming_locks_flagged_nodes() {
        let streaming = Arc::new(AtomicBool::new(false));
        let map = SimNodeMap::builder()
            .integer("Gain", 0, 0, 10, NodeAccess::READ_WRITE)
            .locked_while_streaming()
            .build(streaming.clone());
        assert!(map.is_writable("Gain"));
        streaming.store(true, Ordering::Release);
        assert!(matches!(
            map.set_integer("Gain", 1),
            Err(CameraError::NodeNotWritable(_))
        ));
    }
}
