//! Структурные правки дерева по пространству Merkle-ключей:
//! mark_path_dirty (вставка пути) и delete (удаление с консолидацией).
//!
//! Узлы адресуются префиксом пути; ключи дерева фиксированной длины
//! (64 нибла), поэтому ветка никогда не несёт собственного значения, а
//! остаток пути листа может быть пустым только на полной глубине.

use anyhow::Result;
use log::trace;

use crate::error::Error;
use crate::key::Key;
use crate::nibble::{NibbleBuf, NibblePath};

use super::node::{Branch, Node};
use super::MerkleCommit;

fn read_node<C: MerkleCommit + ?Sized>(
    commit: &C,
    prefix: &NibblePath<'_>,
) -> Result<Option<Node>> {
    match commit.get_value(&Key::merkle(*prefix))? {
        None => Ok(None),
        Some(bytes) if bytes.is_empty() => Err(Error::IntegrityViolation(format!(
            "empty merkle node at depth {}",
            prefix.len()
        ))
        .into()),
        Some(bytes) => Ok(Some(Node::decode(&bytes)?)),
    }
}

fn write_node<C: MerkleCommit + ?Sized>(
    commit: &mut C,
    prefix: &NibblePath<'_>,
    node: &Node,
) -> Result<()> {
    commit.set_value(&Key::merkle(*prefix), &node.encode())
}

fn remove_node<C: MerkleCommit + ?Sized>(
    commit: &mut C,
    prefix: &NibblePath<'_>,
) -> Result<()> {
    commit.remove_value(&Key::merkle(*prefix))
}

/// Вставка пути в дерево: перестраивает структуру так, чтобы лист по path
/// существовал; мемоизация на пройденных ветках сбрасывается.
pub fn mark_path_dirty<C: MerkleCommit + ?Sized>(
    commit: &mut C,
    path: &NibblePath<'_>,
) -> Result<()> {
    let mut depth = 0usize;
    loop {
        let prefix = path.slice_to(depth);
        let Some(node) = read_node(commit, &prefix)? else {
            write_node(commit, &prefix, &Node::leaf(&path.slice_from(depth)))?;
            trace!("dirty: new leaf at depth {}", depth);
            return Ok(());
        };
        match node {
            Node::Leaf { path: lp } => {
                let remaining = path.slice_from(depth);
                let lpath = lp.as_path();
                if lpath == remaining {
                    // Тот же лист: меняется только значение.
                    return Ok(());
                }
                let d = remaining.first_different_nibble(&lpath);
                debug_assert!(d < remaining.len() && d < lpath.len());
                let mut branch = Branch::default();
                branch.embedded_set_leaf(
                    remaining.nibble_at(d),
                    NibbleBuf::from_path(&remaining.slice_from(d + 1)),
                );
                branch.embedded_set_leaf(
                    lpath.nibble_at(d),
                    NibbleBuf::from_path(&lpath.slice_from(d + 1)),
                );
                if d > 0 {
                    write_node(commit, &prefix, &Node::extension(&remaining.slice_to(d)))?;
                }
                write_node(
                    commit,
                    &path.slice_to(depth + d),
                    &Node::Branch(branch),
                )?;
                trace!("dirty: leaf split at depth {} (+{})", depth, d);
                return Ok(());
            }
            Node::Extension { path: ep } => {
                let remaining = path.slice_from(depth);
                let epath = ep.as_path();
                let d = remaining.first_different_nibble(&epath);
                if d == epath.len() {
                    depth += d;
                    continue;
                }
                debug_assert!(d < remaining.len(), "key ends inside an extension");

                // Разрез расширения: общий префикс (если есть) + ветка с
                // усечённым расширением и новым встроенным листом.
                let mut branch = Branch::default();
                let en = epath.nibble_at(d);
                let rn = remaining.nibble_at(d);
                branch.children.set(en);
                branch.embedded_set_leaf(
                    rn,
                    NibbleBuf::from_path(&remaining.slice_from(d + 1)),
                );

                let rest = epath.slice_from(d + 1);
                if !rest.is_empty() {
                    // Остаток расширения переезжает под ветку.
                    let mut wb = crate::nibble::work_buf();
                    let ext_prefix = prefix.append(&epath.slice_to(d + 1), &mut wb);
                    write_node(commit, &ext_prefix, &Node::extension(&rest))?;
                }
                // Иначе прежняя цель расширения уже лежит по prefix+epath —
                // она и есть ребёнок en.

                if d > 0 {
                    write_node(commit, &prefix, &Node::extension(&remaining.slice_to(d)))?;
                }
                write_node(commit, &path.slice_to(depth + d), &Node::Branch(branch))?;
                trace!("dirty: extension split at depth {} (+{})", depth, d);
                return Ok(());
            }
            Node::Branch(mut branch) => {
                let remaining = path.slice_from(depth);
                if remaining.is_empty() {
                    return Err(Error::IntegrityViolation(format!(
                        "branch at full depth {}",
                        depth
                    ))
                    .into());
                }
                let nib = remaining.nibble_at(0);
                branch.invalidate(nib);

                if let Some(elp) = branch.embedded_get(nib).copied() {
                    if elp.as_path() == remaining.slice_from(1) {
                        // Значение существующего встроенного листа.
                        write_node(commit, &prefix, &Node::Branch(branch))?;
                        return Ok(());
                    }
                    // Материализуем встроенный лист в отдельный узел и
                    // спускаемся — следующая итерация разрежет его.
                    branch.embedded_remove(nib);
                    write_node(commit, &prefix, &Node::Branch(branch))?;
                    write_node(
                        commit,
                        &path.slice_to(depth + 1),
                        &Node::Leaf { path: elp },
                    )?;
                    depth += 1;
                    continue;
                }
                if branch.children.contains(nib) {
                    write_node(commit, &prefix, &Node::Branch(branch))?;
                    depth += 1;
                    continue;
                }
                // Новый короткий ребёнок — встроенным листом.
                branch.embedded_set_leaf(nib, NibbleBuf::from_path(&remaining.slice_from(1)));
                write_node(commit, &prefix, &Node::Branch(branch))?;
                return Ok(());
            }
        }
    }
}

/// Результат удаления пути.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteStatus {
    KeyDoesNotExist,
    LeafDeleted,
    BranchToLeafOrExtension,
    ExtensionToLeaf,
    NodeTypePreserved,
}

/// Удаление пути с консолидацией на обратном ходе: ветка с единственным
/// оставшимся ребёнком схлопывается, смежные расширения сливаются.
pub fn delete<C: MerkleCommit + ?Sized>(
    commit: &mut C,
    path: &NibblePath<'_>,
) -> Result<DeleteStatus> {
    delete_at(commit, path, 0)
}

fn delete_at<C: MerkleCommit + ?Sized>(
    commit: &mut C,
    path: &NibblePath<'_>,
    depth: usize,
) -> Result<DeleteStatus> {
    let prefix = path.slice_to(depth);
    let Some(node) = read_node(commit, &prefix)? else {
        return Ok(DeleteStatus::KeyDoesNotExist);
    };
    match node {
        Node::Leaf { path: lp } => {
            if lp.as_path() == path.slice_from(depth) {
                remove_node(commit, &prefix)?;
                Ok(DeleteStatus::LeafDeleted)
            } else {
                Ok(DeleteStatus::KeyDoesNotExist)
            }
        }
        Node::Extension { path: ep } => {
            let epath = ep.as_path();
            if !path.slice_from(depth).starts_with(&epath) {
                return Ok(DeleteStatus::KeyDoesNotExist);
            }
            let child_depth = depth + epath.len();
            let st = delete_at(commit, path, child_depth)?;
            match st {
                DeleteStatus::KeyDoesNotExist => Ok(DeleteStatus::KeyDoesNotExist),
                DeleteStatus::NodeTypePreserved => Ok(DeleteStatus::NodeTypePreserved),
                DeleteStatus::LeafDeleted => Err(Error::IntegrityViolation(format!(
                    "extension child vanished at depth {}",
                    child_depth
                ))
                .into()),
                DeleteStatus::BranchToLeafOrExtension | DeleteStatus::ExtensionToLeaf => {
                    // Ребёнок стал листом/расширением: сливаем пути.
                    let child_prefix = path.slice_to(child_depth);
                    let Some(child) = read_node(commit, &child_prefix)? else {
                        return Err(Error::IntegrityViolation(format!(
                            "missing collapsed child at depth {}",
                            child_depth
                        ))
                        .into());
                    };
                    match child {
                        Node::Leaf { path: lp2 } => {
                            remove_node(commit, &child_prefix)?;
                            let mut joined = NibbleBuf::from_path(&epath);
                            joined.extend(&lp2.as_path());
                            write_node(commit, &prefix, &Node::Leaf { path: joined })?;
                            Ok(DeleteStatus::ExtensionToLeaf)
                        }
                        Node::Extension { path: ep2 } => {
                            remove_node(commit, &child_prefix)?;
                            let mut joined = NibbleBuf::from_path(&epath);
                            joined.extend(&ep2.as_path());
                            write_node(commit, &prefix, &Node::Extension { path: joined })?;
                            Ok(DeleteStatus::NodeTypePreserved)
                        }
                        Node::Branch(_) => Ok(DeleteStatus::NodeTypePreserved),
                    }
                }
            }
        }
        Node::Branch(mut branch) => {
            let remaining = path.slice_from(depth);
            if remaining.is_empty() {
                return Err(
                    Error::IntegrityViolation(format!("branch at full depth {}", depth)).into(),
                );
            }
            let nib = remaining.nibble_at(0);

            if let Some(elp) = branch.embedded_get(nib).copied() {
                if elp.as_path() != remaining.slice_from(1) {
                    return Ok(DeleteStatus::KeyDoesNotExist);
                }
                branch.remove_child(nib);
                branch.keccak = None;
                consolidate(commit, path, depth, branch)
            } else if branch.children.contains(nib) {
                let st = delete_at(commit, path, depth + 1)?;
                match st {
                    DeleteStatus::KeyDoesNotExist => Ok(DeleteStatus::KeyDoesNotExist),
                    DeleteStatus::LeafDeleted => {
                        branch.remove_child(nib);
                        branch.keccak = None;
                        consolidate(commit, path, depth, branch)
                    }
                    _ => {
                        branch.invalidate(nib);
                        write_node(commit, &prefix, &Node::Branch(branch))?;
                        Ok(DeleteStatus::NodeTypePreserved)
                    }
                }
            } else {
                Ok(DeleteStatus::KeyDoesNotExist)
            }
        }
    }
}

/// Схлопывание ветки после удаления ребёнка.
fn consolidate<C: MerkleCommit + ?Sized>(
    commit: &mut C,
    path: &NibblePath<'_>,
    depth: usize,
    branch: Branch,
) -> Result<DeleteStatus> {
    let prefix = path.slice_to(depth);
    match branch.children.count() {
        0 => {
            // Пустая ветка возможна только как корень дерева.
            remove_node(commit, &prefix)?;
            Ok(DeleteStatus::LeafDeleted)
        }
        1 => {
            let only = branch.children.only_set().expect("count == 1");
            if let Some(elp) = branch.embedded_get(only) {
                let mut joined = NibbleBuf::new();
                joined.push(only);
                joined.extend(&elp.as_path());
                write_node(commit, &prefix, &Node::Leaf { path: joined })?;
                return Ok(DeleteStatus::BranchToLeafOrExtension);
            }
            // Настоящий дочерний узел: prefix + only.
            let mut wb = crate::nibble::work_buf();
            let child_prefix = prefix.append_nibble(only, &mut wb);
            let Some(child) = read_node_at(commit, &child_prefix)? else {
                return Err(Error::IntegrityViolation(format!(
                    "single branch child {:x} missing at depth {}",
                    only,
                    depth + 1
                ))
                .into());
            };
            match child {
                Node::Leaf { path: lp2 } => {
                    remove_node(commit, &child_prefix)?;
                    let mut joined = NibbleBuf::new();
                    joined.push(only);
                    joined.extend(&lp2.as_path());
                    write_node(commit, &prefix, &Node::Leaf { path: joined })?;
                }
                Node::Extension { path: ep2 } => {
                    remove_node(commit, &child_prefix)?;
                    let mut joined = NibbleBuf::new();
                    joined.push(only);
                    joined.extend(&ep2.as_path());
                    write_node(commit, &prefix, &Node::Extension { path: joined })?;
                }
                Node::Branch(_) => {
                    let mut single = NibbleBuf::new();
                    single.push(only);
                    write_node(commit, &prefix, &Node::Extension { path: single })?;
                }
            }
            Ok(DeleteStatus::BranchToLeafOrExtension)
        }
        _ => {
            write_node(commit, &prefix, &Node::Branch(branch))?;
            Ok(DeleteStatus::NodeTypePreserved)
        }
    }
}

fn read_node_at<C: MerkleCommit + ?Sized>(
    commit: &C,
    prefix: &NibblePath<'_>,
) -> Result<Option<Node>> {
    read_node(commit, prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::testing::MapCommit;

    fn node_at(commit: &MapCommit, path: &NibblePath<'_>, depth: usize) -> Option<Node> {
        read_node(commit, &path.slice_to(depth)).unwrap()
    }

    #[test]
    fn first_insert_writes_root_leaf() {
        let mut c = MapCommit::default();
        let h = [0xABu8; 32];
        let p = NibblePath::from_keccak(&h);
        mark_path_dirty(&mut c, &p).unwrap();

        match node_at(&c, &p, 0) {
            Some(Node::Leaf { path }) => assert_eq!(path.as_path(), p),
            other => panic!("expected root leaf, got {:?}", other),
        }
    }

    #[test]
    fn same_path_twice_changes_nothing() {
        let mut c = MapCommit::default();
        let h = [0x17u8; 32];
        let p = NibblePath::from_keccak(&h);
        mark_path_dirty(&mut c, &p).unwrap();
        let snapshot = c.map.clone();
        mark_path_dirty(&mut c, &p).unwrap();
        assert_eq!(c.map, snapshot);
    }

    #[test]
    fn diverging_leaf_becomes_extension_branch_with_embedded() {
        let mut c = MapCommit::default();
        let a = [0x11u8; 32];
        let mut braw = a;
        braw[1] = 0x21; // различие в нибле 2
        let pa = NibblePath::from_keccak(&a);
        let pb = NibblePath::from_keccak(&braw);

        mark_path_dirty(&mut c, &pa).unwrap();
        mark_path_dirty(&mut c, &pb).unwrap();

        // Корень — расширение с общим префиксом из двух ниблов.
        match node_at(&c, &pa, 0) {
            Some(Node::Extension { path }) => {
                assert_eq!(path.as_path(), pa.slice_to(2));
            }
            other => panic!("expected extension at root, got {:?}", other),
        }
        // Ветка на глубине 2 с двумя встроенными листьями.
        match node_at(&c, &pa, 2) {
            Some(Node::Branch(b)) => {
                assert_eq!(b.children.count(), 2);
                assert!(b.embedded_contains(pa.nibble_at(2)));
                assert!(b.embedded_contains(pb.nibble_at(2)));
                assert_eq!(
                    b.embedded_get(pa.nibble_at(2)).unwrap().as_path(),
                    pa.slice_from(3)
                );
            }
            other => panic!("expected branch at depth 2, got {:?}", other),
        }
    }

    #[test]
    fn diverge_at_first_nibble_skips_extension() {
        let mut c = MapCommit::default();
        let a = [0x11u8; 32];
        let mut braw = a;
        braw[0] = 0xF1;
        let pa = NibblePath::from_keccak(&a);
        let pb = NibblePath::from_keccak(&braw);
        mark_path_dirty(&mut c, &pa).unwrap();
        mark_path_dirty(&mut c, &pb).unwrap();

        match node_at(&c, &pa, 0) {
            Some(Node::Branch(b)) => assert_eq!(b.children.count(), 2),
            other => panic!("expected branch at root, got {:?}", other),
        }
    }

    #[test]
    fn two_child_branch_collapses_on_delete() {
        let mut c = MapCommit::default();
        let a = [0x11u8; 32];
        let mut braw = a;
        braw[1] = 0x21;
        let pa = NibblePath::from_keccak(&a);
        let pb = NibblePath::from_keccak(&braw);
        mark_path_dirty(&mut c, &pa).unwrap();
        mark_path_dirty(&mut c, &pb).unwrap();

        // Удаление одного из двух: ветка схлопывается, расширение сливается
        // с получившимся листом.
        let st = delete(&mut c, &pb).unwrap();
        assert_eq!(st, DeleteStatus::ExtensionToLeaf);
        match node_at(&c, &pa, 0) {
            Some(Node::Leaf { path }) => assert_eq!(path.as_path(), pa),
            other => panic!("expected merged root leaf, got {:?}", other),
        }

        let st = delete(&mut c, &pa).unwrap();
        assert_eq!(st, DeleteStatus::LeafDeleted);
        assert!(c.map.is_empty());
    }

    #[test]
    fn delete_missing_reports_key_does_not_exist() {
        let mut c = MapCommit::default();
        let a = [0x42u8; 32];
        let mut braw = a;
        braw[31] = 0x43;
        let pa = NibblePath::from_keccak(&a);
        let pb = NibblePath::from_keccak(&braw);

        assert_eq!(delete(&mut c, &pa).unwrap(), DeleteStatus::KeyDoesNotExist);
        mark_path_dirty(&mut c, &pa).unwrap();
        assert_eq!(delete(&mut c, &pb).unwrap(), DeleteStatus::KeyDoesNotExist);
        // Исходный лист не пострадал.
        assert!(matches!(node_at(&c, &pa, 0), Some(Node::Leaf { .. })));
    }

    #[test]
    fn extension_split_on_partial_overlap() {
        let mut c = MapCommit::default();
        // Три пути: два с общими четырьмя ниблами, третий ломает общий
        // префикс на втором нибле.
        let a = [0x12, 0x34, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
            0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
            0x55, 0x55, 0x55, 0x55, 0x55];
        let mut braw = a;
        braw[2] = 0x66;
        let mut craw = a;
        craw[0] = 0x1A;
        let pa = NibblePath::from_keccak(&a);
        let pb = NibblePath::from_keccak(&braw);
        let pc = NibblePath::from_keccak(&craw);

        mark_path_dirty(&mut c, &pa).unwrap();
        mark_path_dirty(&mut c, &pb).unwrap();
        // Сейчас корень — расширение длины 4.
        match node_at(&c, &pa, 0) {
            Some(Node::Extension { path }) => assert_eq!(path.as_path().len(), 4),
            other => panic!("expected extension, got {:?}", other),
        }

        mark_path_dirty(&mut c, &pc).unwrap();
        // Разрез: общий префикс длины 1, затем ветка {2, A}.
        match node_at(&c, &pa, 0) {
            Some(Node::Extension { path }) => assert_eq!(path.as_path(), pa.slice_to(1)),
            other => panic!("expected shortened extension, got {:?}", other),
        }
        match node_at(&c, &pa, 1) {
            Some(Node::Branch(b)) => {
                assert!(b.children.contains(pa.nibble_at(1)));
                assert!(b.children.contains(pc.nibble_at(1)));
            }
            other => panic!("expected split branch, got {:?}", other),
        }
        // Усечённое расширение под веткой ведёт к старой ветке глубины 4.
        match node_at(&c, &pa, 2) {
            Some(Node::Extension { path }) => assert_eq!(path.as_path(), pa.slice_from(2).slice_to(2)),
            other => panic!("expected truncated extension, got {:?}", other),
        }
        assert!(matches!(node_at(&c, &pa, 4), Some(Node::Branch(_))));
    }
}
